//! Live session: lifecycle state machine, per-conversation contexts,
//! optimistic sends, interrupts and reconnect policy.

pub mod backoff;
pub mod context;
pub mod controller;
pub mod error;
pub mod handle;
pub mod interrupt;
pub mod optimistic;
pub mod state;

pub use backoff::ReconnectPolicy;
pub use context::{ContextEffect, ConversationContext, ConversationContextStore, ConversationSnapshot};
pub use controller::SessionController;
pub use error::{ErrorKind, SessionError};
pub use handle::{SessionCommand, SessionEvent, SessionHandle};
pub use interrupt::{InterruptCoordinator, ResumePlan};
pub use optimistic::{OptimisticUpdateManager, PendingSend};
pub use state::{SessionState, StreamPhase};
