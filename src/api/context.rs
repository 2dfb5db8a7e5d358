//! Query context
//!
//! Owns the metadata registry, the raw source, the multiplexer and the
//! derive catalog for one logical node connection. Everything that used to
//! hang off a global client object is reached through this value.

use std::sync::Arc;

use futures_util::future::{self, FutureExt};

use crate::derive::{
    democracy, DeriveCatalog, DeriveComposer, DeriveDef, FeedOpener, InputBuilder, MappingFn,
};
use crate::error::{Error, Result};
use crate::metadata::{MethodRegistry, QueryKey};
use crate::mux::{Multiplexer, MuxConfig, Subscription};
use crate::source::{BoxFuture, RawFeed, RawQuerySource};
use crate::value::Value;

struct ApiInner {
    registry: Arc<MethodRegistry>,
    source: Arc<dyn RawQuerySource>,
    mux: Multiplexer,
    catalog: DeriveCatalog,
}

impl ApiInner {
    fn composer(self: &Arc<Self>) -> DeriveComposer {
        let opener: Arc<dyn FeedOpener> = Arc::clone(self) as Arc<dyn FeedOpener>;
        DeriveComposer::new(self.mux.clone(), opener)
    }
}

impl FeedOpener for ApiInner {
    fn open_feed(self: Arc<Self>, key: QueryKey) -> BoxFuture<'static, Result<RawFeed>> {
        match &key {
            QueryKey::Storage {
                module,
                method,
                args,
            } => match self.registry.resolve(module, method) {
                Ok(descriptor) => self.source.open(descriptor, Arc::clone(args)),
                Err(err) => future::err(err).boxed(),
            },
            QueryKey::Derived { mapping, inputs } => match self.catalog.by_id(mapping) {
                Some(def) => self
                    .composer()
                    .join(inputs.to_vec(), Arc::clone(&def.mapping)),
                None => {
                    let err = Error::UnknownMethod {
                        module: "derive".into(),
                        method: mapping.to_string(),
                    };
                    future::err(err).boxed()
                }
            },
        }
    }
}

/// Entry point for raw and derived live queries
///
/// Cheap to clone; clones share streams and registered derives.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use storage_derive::{Api, MemorySource, MethodRegistry, Value};
///
/// # async fn example() -> storage_derive::Result<()> {
/// let registry = Arc::new(MethodRegistry::builtin()?);
/// let source = Arc::new(MemorySource::new(Arc::clone(&registry)));
/// let api = Api::new(registry, source).with_builtins();
///
/// let accounts = Value::List(vec![]);
/// let votes = api.call("democracy", "votes", vec![Value::Uint(0), accounts]).await?;
/// assert_eq!(votes.current(), Some(&Value::List(vec![])));
///
/// api.release_subscriber(votes);
/// api.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Api {
    inner: Arc<ApiInner>,
}

impl Api {
    /// Create a context with default multiplexer configuration
    pub fn new(registry: Arc<MethodRegistry>, source: Arc<dyn RawQuerySource>) -> Self {
        Self::with_config(registry, source, MuxConfig::default())
    }

    /// Create a context with custom multiplexer configuration
    pub fn with_config(
        registry: Arc<MethodRegistry>,
        source: Arc<dyn RawQuerySource>,
        config: MuxConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ApiInner {
                registry,
                source,
                mux: Multiplexer::with_config(config),
                catalog: DeriveCatalog::new(),
            }),
        }
    }

    /// Register the derives bundled with the crate
    pub fn with_builtins(self) -> Self {
        for def in democracy::all() {
            self.register(def);
        }
        self
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.inner.registry
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.inner.mux
    }

    /// Subscribe to a raw storage item
    ///
    /// Unknown methods and malformed arguments fail before anything is
    /// opened.
    pub async fn query(&self, module: &str, method: &str, args: Vec<Value>) -> Result<Subscription> {
        let key = self.inner.registry.build_query_key(module, method, args)?;
        let inner = Arc::clone(&self.inner);

        self.inner
            .mux
            .acquire(key, move |key| inner.open_feed(key))
            .await
    }

    /// Declare a derive function
    pub fn register_derive(&self, section: &str, name: &str, mapping: MappingFn, inputs: InputBuilder) {
        self.register(DeriveDef::new(section, name, mapping, inputs));
    }

    /// Declare a derive function from a prepared definition
    pub fn register(&self, def: DeriveDef) {
        self.inner.catalog.register(def);
    }

    /// Registered derive functions, as `section.name`
    pub fn derives(&self) -> Vec<String> {
        self.inner.catalog.names()
    }

    /// Subscribe to a derive function
    pub async fn call(&self, section: &str, name: &str, args: Vec<Value>) -> Result<Subscription> {
        let def = self.inner.catalog.get(section, name)?;
        let inputs = (def.inputs)(&self.inner.registry, &args)?;

        tracing::debug!(
            derive = %def.mapping_id(),
            inputs = inputs.len(),
            "Derive call"
        );

        self.inner
            .composer()
            .derive(&def.mapping_id(), inputs, Arc::clone(&def.mapping))
            .await
    }

    /// Give up a subscriber handle
    pub fn release_subscriber(&self, mut subscription: Subscription) {
        subscription.release();
    }

    /// Close every stream and wait for the source to acknowledge
    pub async fn shutdown(&self) {
        self.inner.mux.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio_test::assert_ok;

    use super::*;
    use crate::source::MemorySource;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn account(byte: u8) -> Value {
        Value::Bytes(Bytes::from(vec![byte; 32]))
    }

    fn setup() -> (Api, MemorySource) {
        init_tracing();
        let registry = Arc::new(MethodRegistry::builtin().unwrap());
        let source = MemorySource::new(Arc::clone(&registry));
        let api = Api::new(registry, Arc::new(source.clone())).with_builtins();
        (api, source)
    }

    fn vote_args(accounts: &[u8]) -> Vec<Value> {
        vec![
            Value::Uint(7),
            Value::List(accounts.iter().map(|b| account(*b)).collect()),
        ]
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_shares_one_subscription() {
        let (api, source) = setup();
        source.set("timestamp", "now", vec![], Value::Uint(100)).unwrap();

        let mut a = api.query("timestamp", "now", vec![]).await.unwrap();
        let mut b = api.query("timestamp", "now", vec![]).await.unwrap();

        assert_eq!(source.opens(), 1);
        assert_eq!(a.current(), Some(&Value::Uint(100)));
        assert_eq!(b.current(), Some(&Value::Uint(100)));

        source.set("timestamp", "now", vec![], Value::Uint(101)).unwrap();
        assert_eq!(a.next().await, Some(Ok(Value::Uint(101))));
        assert_eq!(b.next().await, Some(Ok(Value::Uint(101))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_argument_mismatch() {
        let (api, source) = setup();

        let err = api
            .query("democracy", "voteOf", vec![Value::Uint(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArgumentMismatch { .. }));

        assert_ok!(
            api.query("democracy", "voteOf", vec![Value::Uint(1), account(1)])
                .await
        );
        assert_eq!(source.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_names_fail_fast() {
        let (api, source) = setup();

        let err = api.query("staking", "bonded", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::UnknownMethod { .. }));

        let err = api.call("democracy", "proposals", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::UnknownMethod { .. }));

        assert_eq!(source.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_votes_without_accounts() {
        let (api, source) = setup();

        let mut votes = api.call("democracy", "votes", vote_args(&[])).await.unwrap();
        assert_eq!(votes.current(), Some(&Value::List(vec![])));
        assert_eq!(source.opens(), 0);

        let next = tokio::time::timeout(Duration::from_secs(1), votes.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_votes_follow_storage() {
        let (api, source) = setup();
        source
            .set("democracy", "voteOf", vec![Value::Uint(7), account(1)], Value::Uint(0x80))
            .unwrap();

        let mut votes = api.call("democracy", "votes", vote_args(&[1, 2])).await.unwrap();

        // Unset votes decode to the declared default
        assert_eq!(
            votes.current(),
            Some(&Value::List(vec![Value::Uint(0x80), Value::Uint(0)]))
        );

        source
            .set("democracy", "voteOf", vec![Value::Uint(7), account(1)], Value::Uint(0x01))
            .unwrap();
        source
            .set("democracy", "voteOf", vec![Value::Uint(7), account(2)], Value::Uint(0x81))
            .unwrap();

        // Both changes land in one recomputation
        assert_eq!(
            votes.next().await,
            Some(Ok(Value::List(vec![Value::Uint(0x01), Value::Uint(0x81)])))
        );
        let next = tokio::time::timeout(Duration::from_secs(1), votes.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tally_callers_share_pipeline() {
        let (api, source) = setup();

        let mut first = api.call("democracy", "tally", vote_args(&[1, 2])).await.unwrap();
        let mut second = api.call("democracy", "tally", vote_args(&[1, 2])).await.unwrap();

        assert_eq!(first.generation(), second.generation());
        assert_eq!(source.opens(), 2);
        assert_eq!(
            second.current(),
            Some(&Value::List(vec![Value::Uint(0), Value::Uint(2)]))
        );

        api.release_subscriber(first);
        settle().await;

        source
            .set("democracy", "voteOf", vec![Value::Uint(7), account(2)], Value::Uint(0x80))
            .unwrap();
        assert_eq!(
            second.next().await,
            Some(Ok(Value::List(vec![Value::Uint(1), Value::Uint(1)])))
        );
        assert_eq!(source.live(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_votes_and_tally_share_inputs() {
        let (api, source) = setup();

        let _votes = api.call("democracy", "votes", vote_args(&[1, 2])).await.unwrap();
        let _tally = api.call("democracy", "tally", vote_args(&[1, 2])).await.unwrap();

        assert_eq!(source.opens(), 2);
        assert_eq!(api.multiplexer().stream_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_failure_reaches_derived_subscribers() {
        let (api, source) = setup();

        let mut a = api.call("democracy", "votes", vote_args(&[1, 2])).await.unwrap();
        let mut b = api.call("democracy", "votes", vote_args(&[1, 2])).await.unwrap();

        source
            .fail("democracy", "voteOf", vec![Value::Uint(7), account(1)], "node restarted")
            .unwrap();

        assert!(matches!(a.next().await, Some(Err(Error::UpstreamFailed { .. }))));
        assert!(matches!(b.next().await, Some(Err(Error::UpstreamFailed { .. }))));
        assert!(a.is_finished() && b.is_finished());
        assert_eq!(a.next().await, None);

        settle().await;
        assert_eq!(source.live(), 0);
        assert_eq!(api.multiplexer().stream_count(), 0);

        // A fresh call reopens everything
        let votes = api.call("democracy", "votes", vote_args(&[1, 2])).await.unwrap();
        assert!(votes.current().is_some());
        assert_eq!(source.opens(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_abandoned_call_and_reopen_during_close() {
        init_tracing();
        let registry = Arc::new(MethodRegistry::builtin().unwrap());
        let source = MemorySource::new(Arc::clone(&registry))
            .open_delay(Duration::from_millis(100))
            .close_delay(Duration::from_millis(50));
        let api = Api::new(registry, Arc::new(source.clone())).with_builtins();

        // Caller gives up while the inputs are still opening
        let abandoned = tokio::time::timeout(
            Duration::from_millis(30),
            api.call("democracy", "votes", vote_args(&[1, 2])),
        )
        .await;
        assert!(abandoned.is_err());

        // The next caller picks up the open already in flight
        let votes = api.call("democracy", "votes", vote_args(&[1, 2])).await.unwrap();
        assert_eq!(
            votes.current(),
            Some(&Value::List(vec![Value::Uint(0), Value::Uint(0)]))
        );
        assert_eq!(source.opens(), 2);
        assert_eq!(source.live(), 2);
        assert_eq!(api.multiplexer().stream_count(), 3);

        api.release_subscriber(votes);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Derived stream is gone, inputs wait for the node to acknowledge
        let keys = api.multiplexer().keys();
        assert_eq!(keys.len(), 2);
        for key in &keys {
            assert!(!key.is_derived());
            let stats = api.multiplexer().stream_stats(key).unwrap();
            assert_eq!(stats.phase, crate::mux::StreamPhase::Closing);
        }
        assert_eq!(source.closes(), 0);

        let votes = api.call("democracy", "votes", vote_args(&[1, 2])).await.unwrap();
        assert!(votes.current().is_some());
        assert_eq!(source.closes(), 2);
        assert_eq!(source.opens(), 4);
        assert_eq!(source.live(), 2);

        drop(votes);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(source.live(), 0);
        assert_eq!(source.closes(), 4);
        assert_eq!(api.multiplexer().stream_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_unavailable_then_retry() {
        let (api, source) = setup();
        source.fail_next_open("connection refused");

        let err = api.query("timestamp", "now", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
        assert!(err.is_retryable());

        assert_ok!(api.query("timestamp", "now", vec![]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_derive() {
        let (api, source) = setup();

        api.register_derive(
            "test",
            "voteCount",
            Arc::new(|values: &[Value]| {
                let count = values
                    .first()
                    .and_then(Value::as_list)
                    .map(|votes| votes.len())
                    .unwrap_or(0);
                Value::Uint(count as u128)
            }),
            Arc::new(|registry: &MethodRegistry, args: &[Value]| -> Result<Vec<QueryKey>> {
                let accounts = args.to_vec();
                let votes = accounts
                    .into_iter()
                    .map(|account| {
                        registry.build_query_key("democracy", "voteOf", vec![Value::Uint(7), account])
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(vec![QueryKey::derived("democracy.votes", votes)])
            }),
        );

        let count = api
            .call("test", "voteCount", vec![account(1), account(2), account(3)])
            .await
            .unwrap();

        assert_eq!(count.current(), Some(&Value::Uint(3)));
        assert_eq!(source.opens(), 3);

        // The inner derive is shared with direct callers
        let _direct = api.call("democracy", "votes", vote_args(&[1, 2, 3])).await.unwrap();
        let inner = QueryKey::derived(
            "democracy.votes",
            (1..=3)
                .map(|b| QueryKey::storage("democracy", "voteOf", vec![Value::Uint(7), account(b)]))
                .collect(),
        );
        assert_eq!(api.multiplexer().subscriber_count(&inner), 2);
        assert_eq!(source.opens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let (api, source) = setup();

        let mut now = api.query("timestamp", "now", vec![]).await.unwrap();
        let _votes = api.call("democracy", "votes", vote_args(&[1])).await.unwrap();
        assert_eq!(source.live(), 2);

        api.shutdown().await;
        settle().await;

        assert_eq!(now.next().await, None);
        assert_eq!(source.live(), 0);
        assert_eq!(api.multiplexer().stream_count(), 0);
    }

    #[test]
    fn test_builtin_derives_registered() {
        let (api, _) = setup();
        assert_eq!(
            api.derives(),
            vec!["democracy.tally".to_string(), "democracy.votes".to_string()]
        );
    }
}
