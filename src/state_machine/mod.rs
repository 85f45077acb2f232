mod item;
mod state;

pub use item::{CompletionEvent, FileCandidate, Outcome, WorkItem};
pub use state::{Event, InvalidTransition, ItemState, StateMachine, Transition};
