mod definitions;
pub use definitions::*;

mod misc;
pub use misc::*;

mod format;
pub use format::*;

mod layout;
pub use layout::*;
