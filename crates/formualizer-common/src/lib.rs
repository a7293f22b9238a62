pub mod cellref;
pub mod coord;
pub mod error;
pub mod intern;
pub mod value;

pub use cellref::*;
pub use coord::*;
pub use error::*;
pub use intern::*;
pub use value::*;
