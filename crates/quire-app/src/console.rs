//! Terminal stand-ins for the speech platform.
//!
//! Each line typed on stdin is one final utterance; spoken replies are
//! printed and "play" for a time proportional to their length so they can
//! be interrupted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;

use quire_voice::{
    RecognitionSession, RecognizerCallback, RecognizerError, RecognizerEvent, SpeechRecognizer,
    SpeechSynthesizer,
};

type Listeners = Arc<Mutex<Vec<(u64, RecognizerCallback)>>>;

/// Delivers typed lines to every running recognition session.
#[derive(Default)]
pub struct ConsoleRecognizer {
    listeners: Listeners,
    next_id: AtomicU64,
}

impl ConsoleRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `line` as a final utterance.
    pub fn hear(&self, line: &str) {
        let callbacks: Vec<RecognizerCallback> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        if callbacks.is_empty() {
            tracing::debug!("Nobody is listening, line dropped");
        }
        for callback in callbacks {
            callback(RecognizerEvent::Final(line.to_string()));
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

impl SpeechRecognizer for ConsoleRecognizer {
    fn start(
        &self,
        on_event: RecognizerCallback,
    ) -> Result<Box<dyn RecognitionSession>, RecognizerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, on_event));
        }
        Ok(Box::new(ConsoleSession {
            id,
            listeners: self.listeners.clone(),
        }))
    }
}

struct ConsoleSession {
    id: u64,
    listeners: Listeners,
}

impl RecognitionSession for ConsoleSession {
    fn stop(&mut self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Prints replies and simulates playback time.
pub struct ConsoleSynthesizer {
    per_word: Duration,
    playing: Mutex<Option<AbortHandle>>,
}

impl ConsoleSynthesizer {
    pub fn new(per_word: Duration) -> Self {
        Self {
            per_word,
            playing: Mutex::new(None),
        }
    }
}

impl SpeechSynthesizer for ConsoleSynthesizer {
    fn speak(&self, text: &str, on_complete: Box<dyn FnOnce() + Send>) {
        println!("assistant> {}", text);
        let words = text.split_whitespace().count().max(1) as u32;
        let duration = self.per_word * words;
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_complete();
        });
        if let Ok(mut playing) = self.playing.lock() {
            if let Some(previous) = playing.replace(task.abort_handle()) {
                previous.abort();
            }
        }
    }

    fn stop(&self) {
        if let Ok(mut playing) = self.playing.lock() {
            if let Some(task) = playing.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn counting_callback() -> (RecognizerCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let callback: RecognizerCallback = Arc::new(move |event| {
            if matches!(event, RecognizerEvent::Final(_)) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        (callback, count)
    }

    #[test]
    fn test_stopped_session_hears_nothing() {
        let recognizer = ConsoleRecognizer::new();
        let (first_cb, first) = counting_callback();
        let (second_cb, second) = counting_callback();

        let mut session = recognizer.start(first_cb).unwrap();
        recognizer.hear("hello");
        session.stop();
        let _other = recognizer.start(second_cb).unwrap();
        recognizer.hear("again");

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(recognizer.active_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_completes() {
        let synthesizer = ConsoleSynthesizer::new(Duration::from_millis(100));
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();

        synthesizer.speak("two words", Box::new(move || flag.store(true, Ordering::SeqCst)));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_playback() {
        let synthesizer = ConsoleSynthesizer::new(Duration::from_millis(100));
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();

        synthesizer.speak("a longer reply", Box::new(move || flag.store(true, Ordering::SeqCst)));
        synthesizer.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!done.load(Ordering::SeqCst));
    }
}
