//! Search input pipeline: key handling, debounce, and cancellation.

mod debounce;
mod input;

pub use debounce::{Debouncer, SearchSink};
pub use input::{InputResult, KeyResult, SearchEvent, SearchField, TextInput};
