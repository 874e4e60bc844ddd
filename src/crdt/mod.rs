pub mod clock;
pub mod operations;
pub mod text;

pub use clock::{SiteClock, VersionVector};
pub use operations::{Operation, OperationKind, SiteId};
pub use text::{SharedText, TextDelta};
