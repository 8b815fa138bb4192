use super::*;
use crate::types::Event;
use std::time::Duration;
use tokio::sync::broadcast;


/// Run from `seed` until the idle timeout stops the pipeline
async fn run_until_idle(pipeline: &Pipeline, seed: &str) -> PipelineStats {
    tokio::time::timeout(
        Duration::from_secs(10),
        pipeline.run_with_seed(CancellationToken::new(), seed),
    )
    .await
    .expect("pipeline should stop once idle")
    .expect("seed should be accepted")
}

fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
