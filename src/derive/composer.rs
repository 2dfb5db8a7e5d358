//! Derive composer
//!
//! Joins several shared streams into one derived feed and registers that
//! feed in the multiplexer under a derived key, so identical derive calls
//! share one pipeline.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::Result;
use crate::metadata::QueryKey;
use crate::mux::{Multiplexer, Subscription};
use crate::source::{BoxFuture, Cancel, RawFeed, SourceEvent};
use crate::value::Value;

/// Pure mapping from the latest input values to the derived value
pub type MappingFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Opens the raw feed behind any query key
///
/// Storage keys go to the node, derived keys back to a composer. Used by
/// the composer to acquire its inputs.
pub trait FeedOpener: Send + Sync + 'static {
    fn open_feed(self: Arc<Self>, key: QueryKey) -> BoxFuture<'static, Result<RawFeed>>;
}

/// Builds derived streams on top of a multiplexer
#[derive(Clone)]
pub struct DeriveComposer {
    mux: Multiplexer,
    opener: Arc<dyn FeedOpener>,
}

impl DeriveComposer {
    pub fn new(mux: Multiplexer, opener: Arc<dyn FeedOpener>) -> Self {
        Self { mux, opener }
    }

    /// Subscribe to `mapping` applied over `inputs`
    ///
    /// Callers passing the same `mapping_id` and inputs share one derived
    /// stream; `mapping` is only used by whichever call opens it, which is
    /// why it must be pure.
    pub async fn derive(
        &self,
        mapping_id: &str,
        inputs: Vec<QueryKey>,
        mapping: MappingFn,
    ) -> Result<Subscription> {
        let key = QueryKey::derived(mapping_id, inputs);
        let composer = self.clone();

        self.mux
            .acquire(key, move |key| composer.join(key.inputs().to_vec(), mapping))
            .await
    }

    /// Open a derived feed: acquire every input and start the join task
    pub fn join(&self, inputs: Vec<QueryKey>, mapping: MappingFn) -> BoxFuture<'static, Result<RawFeed>> {
        let composer = self.clone();

        async move {
            if inputs.is_empty() {
                return Ok(RawFeed::constant(mapping(&[])));
            }

            let mut subs = Vec::with_capacity(inputs.len());
            for input in inputs {
                let opener = Arc::clone(&composer.opener);
                // Inputs already acquired are released on drop if this fails
                let sub = composer
                    .mux
                    .acquire(input, move |key| opener.open_feed(key))
                    .await?;
                subs.push(sub);
            }

            let latest: Vec<Option<Value>> = subs.iter().map(|s| s.current().cloned()).collect();
            let initial = compute(&mapping, &latest);

            let config = composer.mux.config();
            let (tx, rx) = mpsc::channel(config.feed_capacity);
            let (stop_tx, stop_rx) = oneshot::channel();
            let task = tokio::spawn(run_join(
                subs,
                latest,
                mapping,
                tx,
                stop_rx,
                config.debounce_window,
            ));

            let cancel = Cancel::new(move || async move {
                let _ = stop_tx.send(());
                let _ = task.await;
            });

            Ok(RawFeed::new(initial, rx, cancel).coalesced())
        }
        .boxed()
    }
}

fn compute(mapping: &MappingFn, latest: &[Option<Value>]) -> Option<Value> {
    let values: Option<Vec<Value>> = latest.iter().cloned().collect();
    values.map(|values| mapping(&values))
}

/// Recompute once per window from the latest value of every input
async fn run_join(
    subs: Vec<Subscription>,
    mut latest: Vec<Option<Value>>,
    mapping: MappingFn,
    tx: mpsc::Sender<SourceEvent>,
    mut stop: oneshot::Receiver<()>,
    window: Duration,
) {
    let (input_tx, mut input_rx) = mpsc::channel(subs.len().max(1) * 4);
    let mut pumps = JoinSet::new();

    for (index, mut sub) in subs.into_iter().enumerate() {
        let input_tx = input_tx.clone();
        pumps.spawn(async move {
            loop {
                let event = sub.next().await;
                let terminal = !matches!(event, Some(Ok(_)));
                if input_tx.send((index, event)).await.is_err() || terminal {
                    break;
                }
            }
        });
    }
    drop(input_tx);

    let mut dirty = false;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = input_rx.recv() => match event {
                Some((index, Some(Ok(value)))) => {
                    latest[index] = Some(value);
                    if !dirty {
                        dirty = true;
                        deadline = Instant::now() + window;
                    }
                }
                Some((index, Some(Err(err)))) => {
                    let _ = tx.send(SourceEvent::Failed(format!("input {} failed: {}", index, err))).await;
                    break;
                }
                Some((index, None)) => {
                    let _ = tx.send(SourceEvent::Failed(format!("input {} ended", index))).await;
                    break;
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if dirty => {
                dirty = false;
                if let Some(value) = compute(&mapping, &latest) {
                    if tx.send(SourceEvent::Update(value)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Input subscriptions are released as the pumps are dropped
    pumps.shutdown().await;
}
