pub mod dlist;
pub mod index;

pub use dlist::DList;
pub use index::{Index, StringIndex};
