use crate::recognition::{PlateReading, PlateRecognizer, RecognitionError, RecognitionFuture};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub enum MockRecognition {
    Plate { plate: String, confidence: f64 },
    NoPlate,
    Fail,
}

impl MockRecognition {
    pub fn plate(plate: &str, confidence: f64) -> Self {
        Self::Plate {
            plate: plate.to_string(),
            confidence,
        }
    }
}

/// Recognizer that replays a scripted sequence, then reports no plate.
#[derive(Debug, Default)]
pub struct MockRecognizer {
    script: Mutex<Vec<MockRecognition>>,
    calls: AtomicUsize,
}

impl MockRecognizer {
    pub fn new(script: Vec<MockRecognition>) -> Self {
        let mut script = script;
        script.reverse();
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_result(&self) -> Result<Option<PlateReading>, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .map_err(|_| RecognitionError::Unavailable("mock script lock poisoned".to_string()))?
            .pop()
            .unwrap_or(MockRecognition::NoPlate);
        match next {
            MockRecognition::Plate { plate, confidence } => {
                Ok(Some(PlateReading { plate, confidence }))
            }
            MockRecognition::NoPlate => Ok(None),
            MockRecognition::Fail => Err(RecognitionError::Unavailable(
                "mock recognition failed".to_string(),
            )),
        }
    }
}

impl PlateRecognizer for MockRecognizer {
    fn recognize<'a>(&'a self, _image: &'a [u8]) -> RecognitionFuture<'a> {
        let result = self.next_result();
        Box::pin(async move { result })
    }
}
