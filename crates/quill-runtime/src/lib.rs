//! # quill-runtime
//!
//! The conversation machinery: one [`ConversationManager`] per active
//! conversation coordinates an in-flight turn loop with concurrent user
//! input, persistence, and viewer streams. The [`ConversationRegistry`]
//! owns the active managers and evicts idle ones. Turn loops come in two
//! variants — the native LLM loop and the external-CLI loop with its
//! stream-reassembly adapter.

pub mod errors;
pub mod external;
pub mod manager;
pub mod registry;
pub mod subagent;
pub mod turn_loop;

pub use errors::{Result, RuntimeError};
pub use external::{conversation_session_uuid, description_to_slug, ExternalCliLoop};
pub use manager::{
    standard_record_fn, ConversationManager, LoopBackend, ManagerConfig, RecordFn, RecordRequest,
    StreamUpdate, SubagentBridge, ToolSetFactory,
};
pub use registry::{ConversationRegistry, ManagerFactory};
pub use subagent::{NativeSubagentRunner, SubagentRunner};
pub use turn_loop::{NativeTurnLoop, TurnLoop};
