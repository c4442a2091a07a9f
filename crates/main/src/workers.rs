//! Spawns one jittered-interval task per scheduler tick/drain job
//! (spec §4.10). Grounded on the teacher's `smtp` queue manager, which
//! runs its drain loop the same way: an owned handle to the shared
//! state, a sleep-then-work loop, errors logged and swallowed so one bad
//! tick doesn't bring the process down.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use extractor::EntityExtractor;
use jt_config::Config;
use provider::ProviderClient;
use scheduler::Scheduler;
use tokio::task::JoinHandle;
use watch::PollInterval as WatchPollInterval;

pub fn spawn_all<P, E>(scheduler: Arc<Scheduler<P, E>>, config: &Config) -> Vec<JoinHandle<()>>
where
    P: ProviderClient + 'static,
    E: EntityExtractor + 'static,
{
    let poll_interval = match config.poll_interval {
        jt_config::PollInterval::Fast => WatchPollInterval::Fast,
        jt_config::PollInterval::Normal => WatchPollInterval::Normal,
        jt_config::PollInterval::Slow => WatchPollInterval::Slow,
    };
    let notification_pool = config.notification_worker_pool_size.max(1);
    let ai_pool = config.ai_worker_pool_size.max(1);

    let mut handles = Vec::new();

    handles.push(spawn_loop("poll", StdDuration::from_secs(30), scheduler.clone(), move |s| {
        let s = s.clone();
        async move { s.poll_tick(poll_interval).await.map(|_| ()) }
    }));

    handles.push(spawn_loop("watch-renew", StdDuration::from_secs(300), scheduler.clone(), |s| {
        let s = s.clone();
        async move { s.renew_watches_tick().await }
    }));

    for worker_id in 0..notification_pool {
        handles.push(spawn_loop(
            "drain-notifications",
            StdDuration::from_secs(2),
            scheduler.clone(),
            move |s| {
                let s = s.clone();
                async move {
                    let handled = s.drain_notifications(10).await?;
                    if handled > 0 {
                        tracing::debug!(context = "main", event = "drain-notifications", worker = worker_id, handled, "Drained notifications.");
                    }
                    Ok(())
                }
            },
        ));
    }

    for worker_id in 0..ai_pool {
        handles.push(spawn_loop("drain-ai", StdDuration::from_secs(3), scheduler.clone(), move |s| {
            let s = s.clone();
            async move {
                let handled = s.drain_ai_processing(10).await?;
                if handled > 0 {
                    tracing::debug!(context = "main", event = "drain-ai", worker = worker_id, handled, "Drained AI processing queue.");
                }
                Ok(())
            }
        }));
    }

    handles.push(spawn_loop("corrections", StdDuration::from_secs(600), scheduler.clone(), |s| {
        let s = s.clone();
        async move { s.process_corrections_tick().await }
    }));

    handles.push(spawn_loop("reconcile-labels", StdDuration::from_secs(120), scheduler.clone(), |s| {
        let s = s.clone();
        async move { s.reconcile_labels_tick().await }
    }));

    handles
}

fn spawn_loop<P, E, F, Fut>(name: &'static str, base_interval: StdDuration, scheduler: Arc<Scheduler<P, E>>, mut job: F) -> JoinHandle<()>
where
    P: ProviderClient + 'static,
    E: EntityExtractor + 'static,
    F: FnMut(&Arc<Scheduler<P, E>>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), scheduler::SchedulerError>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(scheduler::jittered(base_interval)).await;
            if let Err(e) = job(&scheduler).await {
                tracing::warn!(context = "main", event = "tick-error", job = name, error = %e, "Tick failed, will retry next interval.");
            }
        }
    })
}
