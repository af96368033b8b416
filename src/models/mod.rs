pub mod invoice;
pub mod profile;
pub mod result;
pub mod row;
pub mod rule;
pub mod taxonomy;

pub use invoice::*;
pub use profile::*;
pub use result::*;
pub use row::*;
pub use rule::*;
pub use taxonomy::*;
