pub mod pool;
pub mod process;
pub mod session;
pub mod stream;

pub use pool::{PoolOptions, SessionPool};
pub use session::{
    DeathCallback, SessionError, SessionOptions, SessionState, WorkerReply, WorkerSession,
};
pub use stream::TokenUsage;
