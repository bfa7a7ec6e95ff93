//! Emotion vocabulary, samples and dominant-expression selection.

pub mod store;

pub use store::{EmotionStateStore, PublishOutcome};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Samples at or below this confidence are never accepted.
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

/// The closed emotion vocabulary, declared in canonical order.
///
/// Variant order is the tie-break order used by [`select_dominant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Fearful,
        Emotion::Disgusted,
        Emotion::Surprised,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Fearful => "fearful",
            Emotion::Disgusted => "disgusted",
            Emotion::Surprised => "surprised",
        }
    }

    /// Map a classifier label onto the vocabulary (case-insensitive,
    /// common synonyms accepted).
    pub fn from_label(raw: &str) -> Option<Emotion> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "neutral" => Some(Emotion::Neutral),
            "happy" | "happiness" => Some(Emotion::Happy),
            "sad" | "sadness" => Some(Emotion::Sad),
            "angry" | "anger" => Some(Emotion::Angry),
            "fearful" | "fear" | "scared" => Some(Emotion::Fearful),
            "disgusted" | "disgust" => Some(Emotion::Disgusted),
            "surprised" | "surprise" => Some(Emotion::Surprised),
            _ => None,
        }
    }

    fn rank(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vocabulary entry, or a classifier label outside the vocabulary kept
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmotionLabel {
    Known(Emotion),
    Other(String),
}

impl EmotionLabel {
    pub fn from_raw(raw: &str) -> Self {
        match Emotion::from_label(raw) {
            Some(emotion) => EmotionLabel::Known(emotion),
            None => EmotionLabel::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EmotionLabel::Known(emotion) => emotion.as_str(),
            EmotionLabel::Other(raw) => raw,
        }
    }

    pub fn emotion(&self) -> Option<Emotion> {
        match self {
            EmotionLabel::Known(emotion) => Some(*emotion),
            EmotionLabel::Other(_) => None,
        }
    }
}

impl From<Emotion> for EmotionLabel {
    fn from(emotion: Emotion) -> Self {
        EmotionLabel::Known(emotion)
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionSample {
    pub label: EmotionLabel,
    /// Classifier score in [0.0, 1.0].
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl ExpressionSample {
    /// Sample stamped with the current time.
    pub fn new(label: EmotionLabel, confidence: f32) -> Self {
        Self {
            label,
            confidence,
            timestamp: Utc::now(),
        }
    }
}

/// Pick the dominant expression from raw classifier scores.
///
/// Candidates are ordered by vocabulary order first, then unrecognised labels
/// in the order the classifier reported them; the first candidate holding the
/// strictly greatest score wins. NaN scores are ignored.
pub fn select_dominant(scores: &[(String, f32)]) -> Option<(EmotionLabel, f32)> {
    let mut candidates: Vec<(EmotionLabel, f32)> = scores
        .iter()
        .filter(|(_, score)| !score.is_nan())
        .map(|(raw, score)| (EmotionLabel::from_raw(raw), *score))
        .collect();

    // Stable: unknown labels keep their classifier order.
    candidates.sort_by_key(|(label, _)| {
        label
            .emotion()
            .map(Emotion::rank)
            .unwrap_or(Emotion::ALL.len())
    });

    let mut best: Option<(EmotionLabel, f32)> = None;
    for (label, score) in candidates {
        match &best {
            Some((_, top)) if score <= *top => {}
            _ => best = Some((label, score)),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f32)]) -> Vec<(String, f32)> {
        pairs.iter().map(|(l, s)| (l.to_string(), *s)).collect()
    }

    #[test]
    fn maps_face_api_labels_and_synonyms() {
        for emotion in Emotion::ALL {
            assert_eq!(Emotion::from_label(emotion.as_str()), Some(emotion));
        }
        assert_eq!(Emotion::from_label("Fear"), Some(Emotion::Fearful));
        assert_eq!(Emotion::from_label("DISGUST"), Some(Emotion::Disgusted));
        assert_eq!(Emotion::from_label("surprise"), Some(Emotion::Surprised));
        assert_eq!(Emotion::from_label("contempt"), None);
    }

    #[test]
    fn unknown_labels_pass_through_unchanged() {
        assert_eq!(
            EmotionLabel::from_raw("Contempt"),
            EmotionLabel::Other("Contempt".into())
        );
        assert_eq!(EmotionLabel::from_raw("happy").as_str(), "happy");
    }

    #[test]
    fn picks_the_highest_score() {
        let picked = select_dominant(&scores(&[
            ("neutral", 0.1),
            ("happy", 0.7),
            ("sad", 0.2),
        ]));
        assert_eq!(picked, Some((EmotionLabel::Known(Emotion::Happy), 0.7)));
    }

    #[test]
    fn ties_resolve_to_vocabulary_order_regardless_of_input_order() {
        let forward = scores(&[("surprised", 0.45), ("sad", 0.45), ("neutral", 0.1)]);
        let reversed: Vec<_> = forward.iter().cloned().rev().collect();

        for input in [&forward, &reversed] {
            for _ in 0..10 {
                let picked = select_dominant(input).expect("dominant");
                assert_eq!(picked.0, EmotionLabel::Known(Emotion::Sad));
            }
        }
    }

    #[test]
    fn known_labels_win_ties_against_unknown_ones() {
        let picked = select_dominant(&scores(&[("contempt", 0.5), ("angry", 0.5)]));
        assert_eq!(picked.map(|p| p.0), Some(EmotionLabel::Known(Emotion::Angry)));
    }

    #[test]
    fn nan_scores_are_ignored_and_empty_input_yields_none() {
        assert_eq!(select_dominant(&[]), None);
        let picked = select_dominant(&scores(&[("happy", f32::NAN), ("sad", 0.3)]));
        assert_eq!(picked.map(|p| p.0), Some(EmotionLabel::Known(Emotion::Sad)));
    }

    #[test]
    fn sample_serializes_label_as_plain_string() {
        let sample = ExpressionSample::new(EmotionLabel::Known(Emotion::Fearful), 0.9);
        let json = serde_json::to_value(&sample).expect("serialize sample");
        assert_eq!(json["label"], "fearful");
        assert!(json["timestamp"].is_string());

        let back: ExpressionSample = serde_json::from_value(json).expect("deserialize sample");
        assert_eq!(back.label, EmotionLabel::Known(Emotion::Fearful));
    }
}
