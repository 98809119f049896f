pub mod configuration;
pub mod datafield;
pub mod errors;
pub mod simulation;
pub mod trial;

pub use configuration::*;
pub use datafield::*;
pub use errors::*;
pub use simulation::*;
pub use trial::*;
