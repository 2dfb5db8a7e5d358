//! Per-stream update forwarder
//!
//! The single delivery path for a live stream: reads the raw feed, coalesces
//! bursts into one delivery per window and hands the survivor to the
//! multiplexer, which updates the replay value and broadcasts it under the
//! map lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::metadata::QueryKey;
use crate::source::SourceEvent;
use crate::value::Value;

use super::store::Shared;

/// Forward a feed's updates until it fails or the stream goes away
///
/// The window opens at the first update after a quiet period and is not
/// extended by later ones, so a steady upstream still delivers once per
/// window.
pub(super) async fn run(
    shared: Arc<Shared>,
    key: QueryKey,
    id: u64,
    mut updates: mpsc::Receiver<SourceEvent>,
    window: Duration,
) {
    let mut pending: Option<Value> = None;
    let mut replaced: u64 = 0;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            event = updates.recv() => match event {
                Some(SourceEvent::Update(value)) => {
                    if window.is_zero() {
                        if !shared.publish(&key, id, value, 0) {
                            return;
                        }
                    } else if pending.replace(value).is_some() {
                        replaced += 1;
                    } else {
                        deadline = Instant::now() + window;
                    }
                }
                Some(SourceEvent::Failed(reason)) => {
                    shared.fail(&key, id, reason);
                    return;
                }
                None => {
                    shared.fail(&key, id, "feed closed unexpectedly".to_string());
                    return;
                }
            },
            _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                if let Some(value) = pending.take() {
                    if !shared.publish(&key, id, value, std::mem::take(&mut replaced)) {
                        return;
                    }
                }
            }
        }
    }
}
