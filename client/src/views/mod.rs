//! Text renderings of the slide store for the two roles.

pub mod engineer;
pub mod pathologist;
pub mod queue;

pub use engineer::Dashboard;
pub use pathologist::{review_list, ReviewGrid, SlideViewer};
pub use queue::QueueView;
