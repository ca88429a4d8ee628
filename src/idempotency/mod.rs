pub mod coordinator;
pub mod key_resolver;
pub mod policy;
pub mod request;
pub mod storage;

pub use coordinator::{
    CoordinatorBuilder, CoordinatorConfig, IdempotencyCoordinator, LockContext, LockEntry,
    Outcome, RequestState, LOCK_TTL_CEILING_SECS,
};
pub use key_resolver::{KeyResolver, KeyResolverConfig};
pub use policy::{
    AllOf, AlwaysPolicy, DisabledPolicy, IdempotencyPolicy, MethodPolicy, PathPrefixPolicy,
    PolicySettings,
};
pub use request::{
    HttpRequestFacade, RequestAnnotations, RequestFacade, StoredResponse,
    CONCURRENT_REQUEST_BODY, CONCURRENT_REQUEST_STATUS,
};
pub use storage::{
    KeySpace, MemoryStorage, RedisStorage, StorageBackend, StorageStats, DEFAULT_NAMESPACE,
};
