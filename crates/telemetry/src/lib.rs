//! Structured logging setup.
//!
//! The teacher (`stalwart-mail-server`) logs through its own bespoke
//! `trc` event/telemetry crate. That crate isn't carried forward here —
//! see DESIGN.md — in favour of `tracing`, which the teacher's own
//! `jmap` and `se-common` crates already depend on directly. The span
//! and field conventions below mirror `trc`'s structured-event style
//! (named fields, one span per unit of work) without the bespoke
//! collector/subscriber machinery.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global subscriber. `filter_directive` is typically read
/// from `jt-config`, with `RUST_LOG` taking precedence if set.
pub fn init(filter_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive.to_string()));

    fmt().with_env_filter(filter).with_target(true).init();
}

/// Fields every queue-worker span should carry, so log aggregation can
/// filter by them uniformly across C4/C6 workers.
#[macro_export]
macro_rules! queue_span {
    ($queue:expr, $item_id:expr) => {
        tracing::info_span!("queue_item", queue = $queue, item_id = %$item_id)
    };
}

/// Fields every resolver critical section should carry (spec §4.7,
/// §5 "per (user, thread_id) advisory lock").
#[macro_export]
macro_rules! resolver_span {
    ($user_id:expr, $thread_id:expr) => {
        tracing::info_span!("resolve", user_id = %$user_id, thread_id = %$thread_id)
    };
}
