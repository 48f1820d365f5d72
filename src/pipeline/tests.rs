use super::*;
use crate::test_utils::{FrameScript, InitScript, ScriptedFactory};

fn frame() -> RgbImage {
    RgbImage::new(8, 8)
}

fn manager_with(factory: &Arc<ScriptedFactory>, config: PipelineConfig) -> PipelineManager {
    PipelineManager::new(config, factory.clone())
}

fn new_manager(factory: &Arc<ScriptedFactory>) -> PipelineManager {
    manager_with(factory, PipelineConfig::default())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn wait_for_phase(manager: &PipelineManager, phase: Phase) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while manager.phase() != phase {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("phase not reached");
}

#[tokio::test(start_paused = true)]
async fn first_attempt_success_reaches_worker() {
    let factory = Arc::new(ScriptedFactory::new([InitScript::Ready]));
    let manager = new_manager(&factory);

    assert_eq!(manager.mode(), PipelineMode::Uninitialized);
    assert_eq!(
        manager.initialize(ModelConfig::default()).await,
        PipelineMode::Worker
    );
    assert_eq!(manager.phase(), Phase::Worker);
    assert_eq!(factory.spawn_calls(), 1);

    // already live: no second context
    assert_eq!(
        manager.initialize(ModelConfig::default()).await,
        PipelineMode::Worker
    );
    assert_eq!(factory.spawn_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn spawn_failures_are_retried_within_budget() {
    let factory = Arc::new(ScriptedFactory::new([
        InitScript::SpawnError,
        InitScript::SpawnError,
        InitScript::Ready,
    ]));
    let manager = new_manager(&factory);

    let started = Instant::now();
    assert_eq!(
        manager.initialize(ModelConfig::default()).await,
        PipelineMode::Worker
    );
    assert_eq!(factory.spawn_calls(), 3);
    assert_eq!(manager.stats().contexts_spawned, 1);
    // 500ms + 1s of backoff
    assert!(started.elapsed() >= Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn init_timeouts_fall_back_to_main_thread() {
    let factory = Arc::new(
        ScriptedFactory::new([InitScript::Hang, InitScript::Hang, InitScript::Hang])
            .with_inline(true),
    );
    let manager = new_manager(&factory);

    assert_eq!(
        manager.initialize(ModelConfig::default()).await,
        PipelineMode::MainThread
    );
    settle().await;

    assert_eq!(factory.spawn_calls(), 3);
    assert_eq!(factory.terminations(), vec![1, 1, 1]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_without_inline_disables() {
    let factory = Arc::new(ScriptedFactory::new([
        InitScript::Fail,
        InitScript::Fail,
        InitScript::Fail,
        InitScript::Ready,
    ]));
    let manager = new_manager(&factory);

    assert_eq!(
        manager.initialize(ModelConfig::default()).await,
        PipelineMode::Disabled
    );
    settle().await;

    // the fourth script is never reached
    assert_eq!(factory.spawn_calls(), 3);
    assert_eq!(factory.terminations(), vec![1, 1, 1]);
    assert_eq!(
        manager.submit_frame(frame(), false).await.status,
        FrameStatus::Unavailable
    );
}

#[tokio::test(start_paused = true)]
async fn unsupported_platform_skips_remaining_attempts() {
    let factory = Arc::new(ScriptedFactory::new([InitScript::Unsupported]).with_inline(true));
    let manager = new_manager(&factory);
    assert_eq!(
        manager.initialize(ModelConfig::default()).await,
        PipelineMode::MainThread
    );
    assert_eq!(factory.spawn_calls(), 1);

    let factory = Arc::new(ScriptedFactory::new([InitScript::Unsupported]));
    let manager = new_manager(&factory);
    assert_eq!(
        manager.initialize(ModelConfig::default()).await,
        PipelineMode::Disabled
    );
    assert_eq!(factory.spawn_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn frames_before_initialize_are_unavailable() {
    let factory = Arc::new(ScriptedFactory::new([]));
    let manager = new_manager(&factory);

    let result = manager.submit_frame(frame(), false).await;
    assert_eq!(result.status, FrameStatus::Unavailable);
    assert_eq!(result.sequence_id, None);
    assert_eq!(factory.spawn_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn completed_frame_carries_mask_and_latency() {
    let factory = Arc::new(
        ScriptedFactory::new([InitScript::Ready])
            .with_frames([FrameScript::Respond(Duration::from_millis(40))]),
    );
    let manager = new_manager(&factory);
    manager.initialize(ModelConfig::default()).await;

    let result = manager.submit_frame(frame(), false).await;
    assert!(result.is_completed());
    assert_eq!(result.sequence_id, Some(0));
    assert_eq!(result.latency, Duration::from_millis(40));
    let mask = result.mask.unwrap();
    assert_eq!((mask.width, mask.height), (8, 8));
    assert_eq!(manager.stats().completed, 1);
}

#[tokio::test(start_paused = true)]
async fn busy_submission_returns_without_waiting() {
    let factory = Arc::new(
        ScriptedFactory::new([InitScript::Ready])
            .with_frames([FrameScript::Respond(Duration::from_millis(100))]),
    );
    let manager = new_manager(&factory);
    manager.initialize(ModelConfig::default()).await;

    let (first, second) = tokio::join!(
        manager.submit_frame(frame(), false),
        tokio::time::timeout(
            Duration::from_millis(1),
            manager.submit_frame(frame(), false)
        ),
    );

    assert!(first.is_completed());
    let second = second.expect("busy result must not wait for the in-flight frame");
    assert_eq!(second.status, FrameStatus::Busy);
    assert_eq!(second.sequence_id, None);
    assert_eq!(manager.stats().dropped_busy, 1);
}

#[tokio::test(start_paused = true)]
async fn bursts_keep_a_single_frame_in_flight() {
    let factory = Arc::new(
        ScriptedFactory::new([InitScript::Ready])
            .with_frames([FrameScript::Respond(Duration::from_millis(100))]),
    );
    let manager = Arc::new(new_manager(&factory));
    manager.initialize(ModelConfig::default()).await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..5 {
        let manager = Arc::clone(&manager);
        tasks.spawn(async move { manager.submit_frame(frame(), false).await });
    }

    let mut completed = 0;
    let mut busy = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap().status {
            FrameStatus::Completed => completed += 1,
            FrameStatus::Busy => busy += 1,
            other => panic!("unexpected status {:?}", other),
        }
    }
    assert_eq!((completed, busy), (1, 4));
    let stats = manager.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.dropped_busy, 4);
}

#[tokio::test(start_paused = true)]
async fn late_result_is_discarded() {
    let factory = Arc::new(ScriptedFactory::new([InitScript::Ready]).with_frames([
        FrameScript::Respond(Duration::from_secs(4)),
        FrameScript::Respond(Duration::from_millis(10)),
    ]));
    let manager = new_manager(&factory);
    manager.initialize(ModelConfig::default()).await;

    let first = manager.submit_frame(frame(), false).await;
    assert_eq!(first.status, FrameStatus::TimedOut);
    assert_eq!(
        first.error,
        Some(PipelineError::FrameTimeout { sequence_id: 0 })
    );
    assert_eq!(manager.counters().consecutive_timeouts, 1);

    // the stale answer for frame 0 arrives while frame 1 is in flight
    let second = manager.submit_frame(frame(), false).await;
    assert!(second.is_completed());
    assert_eq!(second.sequence_id, Some(1));

    let stats = manager.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(manager.counters().consecutive_timeouts, 0);
}

#[tokio::test(start_paused = true)]
async fn consecutive_timeouts_trigger_one_recovery() {
    let factory = Arc::new(
        ScriptedFactory::new([InitScript::Ready, InitScript::Ready]).with_frames([
            FrameScript::Hang,
            FrameScript::Hang,
            FrameScript::Hang,
        ]),
    );
    let manager = new_manager(&factory);
    manager.initialize(ModelConfig::default()).await;
    let modes = manager.subscribe_mode();

    for expected in 1..=2 {
        let result = manager.submit_frame(frame(), false).await;
        assert_eq!(result.status, FrameStatus::TimedOut);
        assert_eq!(manager.counters().consecutive_timeouts, expected);
    }
    let third = manager.submit_frame(frame(), false).await;
    assert_eq!(third.status, FrameStatus::TimedOut);
    assert_eq!(manager.counters().consecutive_timeouts, 0);

    wait_for_phase(&manager, Phase::Worker).await;
    settle().await;

    assert_eq!(factory.spawn_calls(), 2);
    assert_eq!(factory.terminations(), vec![1, 0]);
    assert_eq!(manager.stats().recoveries, 1);
    assert_eq!(manager.mode(), PipelineMode::Worker);
    assert!(!modes.has_changed().unwrap());

    // the replacement context serves frames
    assert!(manager.submit_frame(frame(), false).await.is_completed());
}

#[tokio::test(start_paused = true)]
async fn mode_stays_worker_across_recovery() {
    let factory = Arc::new(
        ScriptedFactory::new([InitScript::Ready, InitScript::Hang, InitScript::Ready]).with_frames([
            FrameScript::Hang,
            FrameScript::Hang,
            FrameScript::Hang,
        ]),
    );
    let manager = new_manager(&factory);
    manager.initialize(ModelConfig::default()).await;
    let mut modes = manager.subscribe_mode();
    assert_eq!(*modes.borrow_and_update(), PipelineMode::Worker);

    for _ in 0..3 {
        manager.submit_frame(frame(), false).await;
    }

    // the replacement is still coming up: detail in the phase, not the mode
    assert!(matches!(
        manager.phase(),
        Phase::Initializing {
            recovering: true,
            ..
        }
    ));
    assert_eq!(manager.mode(), PipelineMode::Worker);
    assert_eq!(
        manager.submit_frame(frame(), false).await.status,
        FrameStatus::Unavailable
    );

    // an explicit call joins the running cycle
    assert_eq!(
        manager.initialize(ModelConfig::default()).await,
        PipelineMode::Worker
    );
    assert_eq!(manager.phase(), Phase::Worker);
    settle().await;

    assert_eq!(factory.spawn_calls(), 3);
    assert_eq!(factory.terminations(), vec![1, 1, 0]);
    assert!(!modes.has_changed().unwrap());
}

#[tokio::test(start_paused = true)]
async fn reinitialize_from_main_thread_reports_main_thread_until_resolved() {
    let factory = Arc::new(
        ScriptedFactory::new([InitScript::Unsupported, InitScript::Hang]).with_inline(true),
    );
    let manager = Arc::new(new_manager(&factory));
    assert_eq!(
        manager.initialize(ModelConfig::default()).await,
        PipelineMode::MainThread
    );

    let init = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.initialize(ModelConfig::default()).await })
    };
    settle().await;

    assert_eq!(manager.mode(), PipelineMode::MainThread);
    assert!(matches!(
        manager.phase(),
        Phase::Initializing {
            recovering: false,
            ..
        }
    ));

    // hung attempt, backoff, then a ready context
    assert_eq!(init.await.unwrap(), PipelineMode::Worker);
    assert_eq!(factory.spawn_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_recovery_disables_until_reinitialized() {
    let factory = Arc::new(
        ScriptedFactory::new([
            InitScript::Ready,
            InitScript::Fail,
            InitScript::Fail,
            InitScript::Fail,
        ])
        .with_inline(true)
        .with_frames([FrameScript::Hang, FrameScript::Hang, FrameScript::Hang]),
    );
    let manager = new_manager(&factory);
    manager.initialize(ModelConfig::default()).await;

    for _ in 0..3 {
        manager.submit_frame(frame(), false).await;
    }
    let mut modes = manager.subscribe_mode();
    let mode = *modes
        .wait_for(|m| *m == PipelineMode::Disabled)
        .await
        .unwrap();

    assert_eq!(mode, PipelineMode::Disabled);
    assert_eq!(factory.spawn_calls(), 4);
    assert_eq!(
        manager.submit_frame(frame(), false).await.status,
        FrameStatus::Unavailable
    );

    // no automatic promotion; an explicit call brings the worker back
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(manager.mode(), PipelineMode::Disabled);
    assert_eq!(
        manager.initialize(ModelConfig::default()).await,
        PipelineMode::Worker
    );
    assert_eq!(factory.spawn_calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn context_crash_counts_like_a_timeout() {
    let factory = Arc::new(
        ScriptedFactory::new([InitScript::Ready, InitScript::Ready])
            .with_frames([FrameScript::Crash]),
    );
    let manager = new_manager(&factory);
    manager.initialize(ModelConfig::default()).await;

    let crashed = manager.submit_frame(frame(), false).await;
    assert_eq!(crashed.status, FrameStatus::Failed);
    assert!(matches!(crashed.error, Some(PipelineError::ContextLost(_))));
    assert_eq!(manager.counters().consecutive_timeouts, 1);

    // the dead channel fails fast
    for _ in 0..2 {
        let result = manager.submit_frame(frame(), false).await;
        assert_eq!(result.status, FrameStatus::Failed);
    }

    wait_for_phase(&manager, Phase::Worker).await;
    assert_eq!(factory.spawn_calls(), 2);
    assert_eq!(manager.stats().recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn frame_errors_do_not_trigger_recovery() {
    let factory = Arc::new(
        ScriptedFactory::new([InitScript::Ready]).with_frames([FrameScript::Fail; 4]),
    );
    let manager = new_manager(&factory);
    manager.initialize(ModelConfig::default()).await;

    for sequence_id in 0..4 {
        let result = manager.submit_frame(frame(), false).await;
        assert_eq!(result.status, FrameStatus::Failed);
        assert_eq!(
            result.error,
            Some(PipelineError::FrameError {
                sequence_id,
                message: "inference failed".to_string(),
            })
        );
    }
    assert_eq!(manager.counters().consecutive_timeouts, 0);
    assert_eq!(manager.mode(), PipelineMode::Worker);
    assert_eq!(factory.spawn_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn main_thread_mode_segments_inline() {
    let factory = Arc::new(ScriptedFactory::new([InitScript::Unsupported]).with_inline(true));
    let manager = new_manager(&factory);
    manager.initialize(ModelConfig::default()).await;

    let result = manager.submit_frame(frame(), true).await;
    assert!(result.is_completed());
    assert!(result.mask.is_some());
    assert!(result.transform.is_some());

    let plain = manager.submit_frame(frame(), false).await;
    assert!(plain.transform.is_none());
    assert_eq!(plain.sequence_id, Some(1));
}

#[tokio::test(start_paused = true)]
async fn dispose_fails_pending_frame_and_terminates_context() {
    let factory = Arc::new(
        ScriptedFactory::new([InitScript::Ready]).with_frames([FrameScript::Hang]),
    );
    let manager = Arc::new(new_manager(&factory));
    manager.initialize(ModelConfig::default()).await;

    let pending = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.submit_frame(frame(), false).await })
    };
    settle().await;

    manager.dispose();
    manager.dispose();

    let result = pending.await.unwrap();
    assert_eq!(result.status, FrameStatus::Failed);
    assert_eq!(result.error, Some(PipelineError::Disposed));
    assert_eq!(manager.mode(), PipelineMode::Disabled);

    settle().await;
    assert_eq!(factory.terminations(), vec![1]);
    // no timeout is reported for the abandoned frame
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(manager.stats().timed_out, 0);
}

#[tokio::test(start_paused = true)]
async fn dispose_during_initialization_resolves_disabled() {
    let factory = Arc::new(ScriptedFactory::new([InitScript::Hang]));
    let manager = Arc::new(new_manager(&factory));

    let init = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.initialize(ModelConfig::default()).await })
    };
    settle().await;
    manager.dispose();

    assert_eq!(init.await.unwrap(), PipelineMode::Disabled);
    settle().await;
    assert_eq!(factory.spawn_calls(), 1);
    assert_eq!(factory.terminations(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn skip_interval_follows_latency() {
    let factory = Arc::new(ScriptedFactory::new([InitScript::Ready]).with_frames([
        FrameScript::Respond(Duration::from_millis(2600)),
        FrameScript::Respond(Duration::from_millis(2600)),
    ]));
    let manager = new_manager(&factory);
    assert_eq!(manager.skip_interval(), 1);
    manager.initialize(ModelConfig::default()).await;
    manager.record_render_frame_time(Duration::from_millis(16));

    manager.submit_frame(frame(), false).await;
    assert_eq!(manager.skip_interval(), 3);
    manager.submit_frame(frame(), false).await;
    assert_eq!(manager.skip_interval(), 5);
}
