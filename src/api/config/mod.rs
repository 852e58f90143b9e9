mod rc;

pub use rc::*;
