//! End-to-end tests of the stream processor.

use telemetry_stream::processor::HealthGrade;
use telemetry_stream::simulate::{self, SimulationConfig};
use telemetry_stream::{ConfigError, ProcessorConfig, StreamData, StreamProcessor};

fn grade_for(score: u32) -> HealthGrade {
    match score {
        s if s >= 90 => HealthGrade::Excellent,
        s if s >= 75 => HealthGrade::Good,
        s if s >= 60 => HealthGrade::Fair,
        s if s >= 40 => HealthGrade::Poor,
        _ => HealthGrade::Critical,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_excavation_stream() {
    let mut config = ProcessorConfig::default();
    config.seed = Some(42);
    config.window.window_size = 1000;
    config.window.stride = 100;
    config.workers.num_workers = 6;

    let processor = StreamProcessor::new(config).unwrap();
    processor.start().await;

    let readings = simulate::generate(&SimulationConfig::default()).unwrap();
    assert_eq!(readings.len(), 10_000);

    let mut results = 0usize;
    for data in readings {
        if processor.submit(data).await.is_some() {
            results += 1;
        }
    }
    processor.stop().await;

    let stats = processor.get_performance_statistics();
    let s = &stats.system;
    assert_eq!(s.total_processed + s.total_dropped, 10_000);
    assert!(results as u64 <= s.total_processed);
    assert!(s.total_processed > 0);
    assert!(
        (0.02..=0.15).contains(&s.anomaly_rate),
        "anomaly rate {}",
        s.anomaly_rate
    );
    assert_eq!(stats.sensors.len(), 7);
    assert!(stats
        .sensors
        .values()
        .all(|c| (0.3..=0.9).contains(&c.threshold)));

    let health = processor.get_system_health();
    assert!(health.health_score <= 100);
    assert_eq!(health.grade, grade_for(health.health_score));
    assert!(!health.is_running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_identical_input_reproduces_counts() {
    async fn run_once() -> (u64, u64) {
        let mut config = ProcessorConfig::default();
        config.seed = Some(1234);
        config.window.window_size = 200;
        config.window.stride = 50;
        config.workers.num_workers = 3;
        // Keep latency and throughput penalties out of the admission draw.
        config.flow.latency_threshold_secs = 60.0;
        config.flow.max_throughput = 1e9;

        let processor = StreamProcessor::new(config).unwrap();
        processor.start().await;

        let readings = simulate::generate(&SimulationConfig {
            points: 2000,
            seed: 9,
            ..SimulationConfig::default()
        })
        .unwrap();
        for data in readings {
            processor.submit(data).await;
        }
        processor.stop().await;

        let s = processor.get_performance_statistics().system;
        (s.total_processed, s.total_dropped)
    }

    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first, second);
    assert_eq!(first.0 + first.1, 2000);
    // temperature and the default-priority sensors are sampled
    assert!(first.1 > 0);
}

#[tokio::test]
async fn test_invalid_configuration_fails_fast() {
    let mut config = ProcessorConfig::default();
    config.detector.contamination = 0.0;
    assert!(matches!(
        StreamProcessor::new(config),
        Err(ConfigError::OutOfRange { field: "detector.contamination", .. })
    ));

    let mut config = ProcessorConfig::default();
    config.flow.latency_threshold_secs = f64::INFINITY;
    assert!(matches!(
        StreamProcessor::new(config),
        Err(ConfigError::InvalidDuration { .. })
    ));

    let mut config = ProcessorConfig::default();
    config.flow.adaptation_interval_secs = 1e30;
    assert!(matches!(
        StreamProcessor::new(config),
        Err(ConfigError::InvalidDuration { .. })
    ));

    let mut config = ProcessorConfig::default();
    config.workers.num_workers = 0;
    assert_eq!(
        StreamProcessor::new(config).err(),
        Some(ConfigError::NotPositive {
            field: "workers.num_workers"
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_after_stop() {
    let mut config = ProcessorConfig::default();
    config.seed = Some(5);
    config.workers.num_workers = 2;
    let processor = StreamProcessor::new(config).unwrap();

    processor.start().await;
    processor.start().await;
    assert!(processor
        .submit(StreamData::new("displacement_1", 0.5))
        .await
        .is_some());
    processor.stop().await;

    assert!(processor
        .submit(StreamData::new("displacement_1", 0.5))
        .await
        .is_none());

    processor.start().await;
    assert!(processor
        .submit(StreamData::new("displacement_1", 0.7))
        .await
        .is_some());
    processor.stop().await;

    let s = processor.get_performance_statistics().system;
    assert_eq!(s.total_processed, 2);
    assert_eq!(s.drops.stopped, 1);
    let state = processor.window_state("displacement_1").unwrap();
    assert_eq!(state.total_seen, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streaming_enqueue_and_drain() {
    let mut config = ProcessorConfig::default();
    config.seed = Some(11);
    config.workers.num_workers = 4;
    config.flow.latency_threshold_secs = 60.0;
    let processor = StreamProcessor::new(config).unwrap();
    processor.start().await;

    let accepted = (0..500)
        .filter(|i| processor.enqueue(StreamData::new("strain_gauge_7", (*i % 13) as f64)))
        .count();

    let mut received = 0;
    while received < accepted {
        match processor
            .next_result(std::time::Duration::from_secs(5))
            .await
        {
            Some(_) => received += 1,
            None => break,
        }
    }
    assert_eq!(received, accepted);
    processor.stop().await;
}
