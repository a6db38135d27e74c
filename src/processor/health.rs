//! Composite health scoring.
//!
//! The score starts at 100 and loses points for each signal past its target.
//! Every penalty that fires adds a recommendation.

use serde::Serialize;

// ---------------------------------------------------------------------------
// Grades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthGrade {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthGrade {
    pub fn from_score(score: u32) -> Self {
        match score {
            90.. => HealthGrade::Excellent,
            75..=89 => HealthGrade::Good,
            60..=74 => HealthGrade::Fair,
            40..=59 => HealthGrade::Poor,
            _ => HealthGrade::Critical,
        }
    }
}

impl std::fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthGrade::Excellent => "EXCELLENT",
            HealthGrade::Good => "GOOD",
            HealthGrade::Fair => "FAIR",
            HealthGrade::Poor => "POOR",
            HealthGrade::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

/// Signals the score is computed from.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthInputs {
    pub avg_latency_secs: f64,
    pub drop_rate: f64,
    pub anomaly_rate: f64,
    /// Processed readings per second.
    pub throughput: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAssessment {
    pub score: u32,
    pub grade: HealthGrade,
    pub recommendations: Vec<String>,
}

pub fn assess(inputs: &HealthInputs) -> HealthAssessment {
    let mut score: i32 = 100;
    let mut recommendations = Vec::new();

    if inputs.avg_latency_secs > 0.2 {
        score -= 20;
        recommendations.push(
            "High processing latency: add workers or move the detector to dedicated cores".into(),
        );
    } else if inputs.avg_latency_secs > 0.1 {
        score -= 10;
        recommendations.push("Elevated processing latency: consider adding workers".into());
    }

    if inputs.drop_rate > 0.1 {
        score -= 30;
        recommendations.push(
            "High drop rate: increase buffer_size or max_throughput, or reduce input rate".into(),
        );
    } else if inputs.drop_rate > 0.05 {
        score -= 15;
        recommendations.push("Readings are being dropped: review flow-control limits".into());
    }

    if inputs.anomaly_rate > 0.2 {
        score -= 20;
        recommendations.push(
            "Very high anomaly rate: check sensor calibration and detector contamination".into(),
        );
    } else if inputs.anomaly_rate > 0.1 {
        score -= 10;
        recommendations.push("Anomaly rate above expected: review detector thresholds".into());
    }

    if inputs.throughput < 1000.0 {
        score -= 20;
        recommendations.push("Low throughput: check worker count and upstream ingestion".into());
    } else if inputs.throughput < 5000.0 {
        score -= 10;
        recommendations.push("Throughput below target: consider scaling workers".into());
    }

    let score = score.max(0) as u32;
    if score < 60 {
        recommendations.push("System needs attention: schedule maintenance".into());
    }

    HealthAssessment {
        score,
        grade: HealthGrade::from_score(score),
        recommendations,
    }
}

/// Output of `StreamProcessor::get_system_health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub health_score: u32,
    pub grade: HealthGrade,
    pub is_running: bool,
    pub worker_count: usize,
    pub input_queue_depth: usize,
    pub output_queue_depth: usize,
    pub recommendations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
