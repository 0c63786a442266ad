#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod memory;
pub mod models;
pub mod operations;
pub mod page;
pub mod reconcile;
pub mod store;

pub mod prelude {
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgStore, create_rulebook_tables};
    pub use crate::error::{ErrorDetails, ErrorKind, LibError, Result};
    pub use crate::memory::MemoryStore;
    pub use crate::models::{
        Like, NewRule, NewUser, PageArgs, PasswordDigest, Rule, RuleId, User, UserId,
    };
    pub use crate::operations::{
        LikesUpdate, RulebookOperation, RulebookOperationResult, RulebookOperations,
    };
    pub use crate::page::{Page, PageInfo, PageRequest, read_page};
    pub use crate::reconcile::{EdgeDelta, ReconcileOutcome, reconcile};
    pub use crate::store::{Edge, Keyed, OrderBy, Predicate, Record, Store, StoreError, StoreTx};
}
