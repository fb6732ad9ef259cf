pub mod entries;
pub mod replay;
pub mod validate;

pub use entries::{EntriesCommand, EntryCommand};
pub use replay::ReplayCommand;
pub use validate::ValidateCommand;
