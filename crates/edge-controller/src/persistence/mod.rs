use sqlx::SqlitePool;

pub mod assets;
pub mod events;
pub mod operations;
pub mod responses;
pub mod store;
pub mod tokens;

pub type Db = SqlitePool;

pub use assets::ManagedAssetRecord;
pub use events::AgentStartRecord;
pub use operations::AgentOpRecord;
pub use responses::{AgentOpResponseRecord, EcOpResponseRecord};
pub use tokens::{JoinTokenRecord, AGENT_JOIN_TOKEN_TTL_SECS};
