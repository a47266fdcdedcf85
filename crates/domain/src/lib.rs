pub mod entities;
pub mod results;
pub mod storage;

pub use entities::*;
pub use results::*;
pub use storage::*;

pub use draftwork_errors::{RuntimeError, RuntimeResult};
