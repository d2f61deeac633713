pub mod error;
pub mod origin;
pub mod traits;
pub mod types;

pub use error::*;
pub use origin::*;
pub use traits::*;
pub use types::*;
