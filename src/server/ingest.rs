//! Server-side enrichment of incoming samples.
//!
//! Image-bearing samples are sent to an emotion detector, the scores are
//! folded into `emotions` under abbreviated keys, and every image is removed
//! before the batch is persisted.

use crate::collector::types::Sample;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

/// Scores below this (after rounding) are discarded.
pub const MINIMUM_ACCEPTED_SCORE: f64 = 1.0;

/// Scores kept regardless of their value.
pub const ALWAYS_RETAINED: [&str; 2] = ["valence", "engagement"];

/// Per-emotion scores for one image, `None` when no face was found.
pub type EmotionReading = Option<BTreeMap<String, f64>>;

/// Emotion analysis errors.
#[derive(Debug)]
pub enum AnalysisError {
    /// Scratch file could not be written
    Scratch(String),
    /// Detector could not be started
    Spawn(String),
    /// Detector printed nothing
    NoOutput,
    /// Detector output was not the expected JSON
    InvalidOutput(String),
}

impl std::fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisError::Scratch(e) => write!(f, "scratch file error: {e}"),
            AnalysisError::Spawn(e) => write!(f, "failed to run emotion detector: {e}"),
            AnalysisError::NoOutput => write!(f, "emotion detector produced no output"),
            AnalysisError::InvalidOutput(e) => write!(f, "invalid detector output: {e}"),
        }
    }
}

impl std::error::Error for AnalysisError {}

/// Maps face images to emotion scores.
#[async_trait]
pub trait EmotionDetector: Send + Sync {
    /// Analyze `images` and return one reading per image, in order.
    async fn analyze(&self, images: &[String]) -> Result<Vec<EmotionReading>, AnalysisError>;
}

#[derive(Debug, Deserialize)]
struct DetectorEntry {
    #[serde(default)]
    emotions: Option<BTreeMap<String, serde_json::Value>>,
}

/// Runs an external detector as `<exe> --file <scratch file>`.
///
/// The scratch file holds one image per line. The detector prints a JSON
/// array with one `{"emotions": {...} | null}` entry per line.
pub struct ExecutableDetector {
    executable: PathBuf,
    scratch_dir: PathBuf,
}

impl ExecutableDetector {
    pub fn new(executable: PathBuf, scratch_dir: PathBuf) -> Self {
        Self {
            executable,
            scratch_dir,
        }
    }

    fn write_scratch(&self, images: &[String]) -> Result<tempfile::NamedTempFile, AnalysisError> {
        std::fs::create_dir_all(&self.scratch_dir)
            .map_err(|e| AnalysisError::Scratch(e.to_string()))?;
        let mut file = tempfile::Builder::new()
            .suffix(".temp")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| AnalysisError::Scratch(e.to_string()))?;
        for image in images {
            writeln!(file, "{image}").map_err(|e| AnalysisError::Scratch(e.to_string()))?;
        }
        file.flush()
            .map_err(|e| AnalysisError::Scratch(e.to_string()))?;
        Ok(file)
    }
}

#[async_trait]
impl EmotionDetector for ExecutableDetector {
    async fn analyze(&self, images: &[String]) -> Result<Vec<EmotionReading>, AnalysisError> {
        // Removed from disk when dropped, on every path out of here.
        let scratch = self.write_scratch(images)?;

        let output = tokio::process::Command::new(&self.executable)
            .arg("--file")
            .arg(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| AnalysisError::Spawn(e.to_string()))?;

        if !output.status.success() {
            tracing::warn!("Emotion detector exited with {}", output.status);
        }

        parse_detector_output(&output.stdout)
    }
}

/// Parse the detector's stdout into readings. Non-numeric scores are ignored.
pub fn parse_detector_output(stdout: &[u8]) -> Result<Vec<EmotionReading>, AnalysisError> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Err(AnalysisError::NoOutput);
    }

    let entries: Vec<DetectorEntry> = serde_json::from_slice(stdout)
        .map_err(|e| AnalysisError::InvalidOutput(e.to_string()))?;

    Ok(entries
        .into_iter()
        .map(|entry| {
            entry.emotions.map(|scores| {
                scores
                    .into_iter()
                    .filter_map(|(name, value)| value.as_f64().map(|v| (name, v)))
                    .collect()
            })
        })
        .collect())
}

/// Short key stored for an emotion name.
pub fn abbreviate(name: &str) -> String {
    if name == "surprise" {
        "su".to_string()
    } else {
        name.chars().next().map(String::from).unwrap_or_default()
    }
}

/// Round to two decimal places.
pub fn round_score(value: f64) -> f64 {
    ((value + f64::EPSILON) * 100.0).round() / 100.0
}

/// Fold raw scores into the stored form: abbreviated keys, rounded values,
/// low scores dropped except valence and engagement. On key collisions the
/// later name in iteration order wins.
pub fn map_emotions(scores: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    scores
        .iter()
        .filter_map(|(name, &value)| {
            let value = round_score(value);
            (ALWAYS_RETAINED.contains(&name.as_str()) || value >= MINIMUM_ACCEPTED_SCORE)
                .then(|| (abbreviate(name), value))
        })
        .collect()
}

/// Enriches batches before persistence.
pub struct DataProcessor {
    detector: Option<Box<dyn EmotionDetector>>,
}

impl DataProcessor {
    pub fn new(detector: Option<Box<dyn EmotionDetector>>) -> Self {
        Self { detector }
    }

    /// Processor that only strips images.
    pub fn without_detector() -> Self {
        Self { detector: None }
    }

    /// Enrich `samples` with emotions and strip every image.
    ///
    /// Analysis failures are logged; the samples are returned without
    /// `emotions` in that case.
    pub async fn process(&self, mut samples: Vec<Sample>) -> Vec<Sample> {
        let images: Vec<String> = samples.iter().filter_map(|s| s.image.clone()).collect();

        match &self.detector {
            Some(detector) if !images.is_empty() => match detector.analyze(&images).await {
                Ok(readings) => {
                    if readings.len() != images.len() {
                        tracing::warn!(
                            "Emotion detector returned {} readings for {} images",
                            readings.len(),
                            images.len()
                        );
                    }
                    let mut readings = readings.into_iter();
                    for sample in samples.iter_mut().filter(|s| s.image.is_some()) {
                        let Some(reading) = readings.next() else {
                            break;
                        };
                        // An image without a face still gets an (empty) reading.
                        sample.emotions =
                            Some(reading.as_ref().map(map_emotions).unwrap_or_default());
                    }
                }
                Err(e) => tracing::error!("Emotion analysis failed: {e}"),
            },
            _ => {}
        }

        for sample in &mut samples {
            sample.image = None;
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct FixedDetector(Vec<EmotionReading>);

    #[async_trait]
    impl EmotionDetector for FixedDetector {
        async fn analyze(&self, _images: &[String]) -> Result<Vec<EmotionReading>, AnalysisError> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    #[async_trait]
    impl EmotionDetector for FailingDetector {
        async fn analyze(&self, _images: &[String]) -> Result<Vec<EmotionReading>, AnalysisError> {
            Err(AnalysisError::NoOutput)
        }
    }

    fn sample(image: Option<&str>) -> Sample {
        Sample {
            user_id: "u1".to_string(),
            timestamp: Utc::now(),
            url: Some("https://example.com/".to_string()),
            mouse: Default::default(),
            scroll: None,
            window: None,
            keyboard: Default::default(),
            image: image.map(String::from),
            emotions: None,
        }
    }

    fn scores(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_abbreviations() {
        assert_eq!(abbreviate("joy"), "j");
        assert_eq!(abbreviate("surprise"), "su");
        assert_eq!(abbreviate("sadness"), "s");
        assert_eq!(abbreviate("valence"), "v");
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_score(2.345678), 2.35);
        assert_eq!(round_score(0.123456), 0.12);
        assert_eq!(round_score(0.2), 0.2);
        assert_eq!(round_score(85.0), 85.0);
    }

    #[test]
    fn test_map_emotions_threshold() {
        let mapped = map_emotions(&scores(&[
            ("joy", 85.0),
            ("surprise", 0.2),
            ("valence", -0.3),
            ("engagement", 0.004),
        ]));
        assert_eq!(mapped, scores(&[("j", 85.0), ("v", -0.3), ("e", 0.0)]));
    }

    #[tokio::test]
    async fn test_image_sample_is_enriched_and_stripped() {
        let detector = FixedDetector(vec![Some(scores(&[("joy", 85.0), ("surprise", 0.2)]))]);
        let processor = DataProcessor::new(Some(Box::new(detector)));

        let plain = sample(None);

        let out = processor
            .process(vec![sample(Some("data:image/png;base64,AAAA")), plain.clone()])
            .await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].emotions, Some(scores(&[("j", 85.0)])));
        assert!(out[0].image.is_none());
        assert_eq!(out[1], plain);
    }

    #[tokio::test]
    async fn test_no_face_gives_empty_emotions() {
        let processor = DataProcessor::new(Some(Box::new(FixedDetector(vec![None]))));
        let out = processor.process(vec![sample(Some("img"))]).await;
        assert_eq!(out[0].emotions, Some(BTreeMap::new()));
    }

    #[tokio::test]
    async fn test_failed_analysis_still_strips_images() {
        let processor = DataProcessor::new(Some(Box::new(FailingDetector)));
        let out = processor
            .process(vec![sample(Some("img")), sample(Some("img2"))])
            .await;
        assert!(out.iter().all(|s| s.image.is_none() && s.emotions.is_none()));

        let out = DataProcessor::without_detector()
            .process(vec![sample(Some("img"))])
            .await;
        assert!(out[0].image.is_none());
    }

    #[test]
    fn test_parse_detector_output() {
        let out = br#"[{"emotions":{"joy":12.5,"label":"x"}},{"emotions":null},{}]"#;
        let readings = parse_detector_output(out).unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0], Some(scores(&[("joy", 12.5)])));
        assert_eq!(readings[1], None);
        assert_eq!(readings[2], None);

        assert!(matches!(
            parse_detector_output(b"  \n"),
            Err(AnalysisError::NoOutput)
        ));
        assert!(matches!(
            parse_detector_output(b"not json"),
            Err(AnalysisError::InvalidOutput(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executable_detector_reads_scratch_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("detector.sh");
        // One reading per non-empty line of the file passed with --file.
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             n=$(grep -c . \"$2\")\n\
             printf '['\n\
             i=0\n\
             while [ $i -lt $n ]; do\n\
               [ $i -gt 0 ] && printf ','\n\
               printf '{\"emotions\":{\"joy\":42}}'\n\
               i=$((i+1))\n\
             done\n\
             printf ']'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let scratch = dir.path().join("scratch");
        let detector = ExecutableDetector::new(script, scratch.clone());
        let readings = detector
            .analyze(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(readings, vec![Some(scores(&[("joy", 42.0)])); 2]);

        // Scratch file is cleaned up.
        assert_eq!(std::fs::read_dir(scratch).unwrap().count(), 0);
    }
}
