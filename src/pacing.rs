//! Timed re-emission of upstream text: short fragments linger, long
//! paragraphs scroll fast.

use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};

use crate::config::PacingSettings;

/// Pure pacing policy plus the frame emitter. Thresholds and chunking count
/// Unicode chars, not bytes.
#[derive(Clone, Debug)]
pub struct StreamPacer {
    min_delay: Duration,
    max_delay: Duration,
    short_text_threshold: usize,
    long_text_threshold: usize,
    chunk_size: usize,
}

impl StreamPacer {
    pub fn new(settings: &PacingSettings) -> Self {
        let short_text_threshold = settings.short_text_threshold.max(1);
        Self {
            min_delay: Duration::from_millis(settings.min_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.min_delay_ms)),
            short_text_threshold,
            long_text_threshold: settings.long_text_threshold.max(short_text_threshold + 1),
            chunk_size: settings.chunk_size.max(1),
        }
    }

    /// Delay between frames for a payload of `char_count` chars: max delay up
    /// to the short threshold, min delay from the long threshold, logarithmic
    /// interpolation in between.
    pub fn delay_for(&self, char_count: usize) -> Duration {
        if char_count <= self.short_text_threshold {
            return self.max_delay;
        }
        if char_count >= self.long_text_threshold {
            return self.min_delay;
        }
        let ratio = (char_count as f64 / self.short_text_threshold as f64).ln()
            / (self.long_text_threshold as f64 / self.short_text_threshold as f64).ln();
        let max = self.max_delay.as_secs_f64();
        let min = self.min_delay.as_secs_f64();
        Duration::from_secs_f64(max - ratio * (max - min))
    }

    pub fn split_chunks(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(self.chunk_size)
            .map(|chunk| chunk.iter().collect())
            .collect()
    }

    /// Expand one text payload into a lazy, timed sequence of wire frames:
    /// fixed-size blocks at or above the long threshold, one char per frame
    /// below it, with the computed delay between frames. Dropping the stream
    /// cancels the remaining frames and sleeps.
    pub fn pace<T, C, F>(
        &self,
        text: &str,
        mut create_chunk: C,
        mut format_frame: F,
    ) -> BoxStream<'static, String>
    where
        T: Send + 'static,
        C: FnMut(String) -> T + Send + 'static,
        F: FnMut(T) -> String + Send + 'static,
    {
        let char_count = text.chars().count();
        if char_count == 0 {
            return stream::empty().boxed();
        }
        let delay = self.delay_for(char_count);
        let pieces: Vec<String> = if char_count >= self.long_text_threshold {
            self.split_chunks(text)
        } else {
            text.chars().map(String::from).collect()
        };
        stream::iter(pieces.into_iter().enumerate())
            .then(move |(index, piece)| {
                let frame = format_frame(create_chunk(piece));
                async move {
                    if index > 0 {
                        tokio::time::sleep(delay).await;
                    }
                    frame
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(min_ms: u64, max_ms: u64, short: usize, long: usize, chunk: usize) -> StreamPacer {
        StreamPacer::new(&PacingSettings {
            enabled: true,
            min_delay_ms: min_ms,
            max_delay_ms: max_ms,
            short_text_threshold: short,
            long_text_threshold: long,
            chunk_size: chunk,
        })
    }

    #[test]
    fn short_text_gets_max_delay_and_long_text_gets_min() {
        let pacer = pacer(16, 24, 10, 50, 5);
        assert_eq!(pacer.delay_for(1), Duration::from_millis(24));
        assert_eq!(pacer.delay_for(10), Duration::from_millis(24));
        assert_eq!(pacer.delay_for(50), Duration::from_millis(16));
        assert_eq!(pacer.delay_for(5000), Duration::from_millis(16));
    }

    #[test]
    fn middle_region_interpolates_and_decreases() {
        let pacer = pacer(16, 24, 10, 50, 5);
        let at_20 = pacer.delay_for(20);
        let at_40 = pacer.delay_for(40);
        assert!(at_20 < Duration::from_millis(24));
        assert!(at_20 > Duration::from_millis(16));
        assert!(at_40 < at_20);
    }

    #[test]
    fn split_chunks_respects_char_boundaries() {
        let pacer = pacer(0, 0, 1, 2, 2);
        let chunks = pacer.split_chunks("héllo");
        assert_eq!(chunks, vec!["hé", "ll", "o"]);
    }

    #[tokio::test]
    async fn char_mode_round_trips_below_long_threshold() {
        let pacer = pacer(0, 0, 2, 100, 5);
        let frames: Vec<String> = pacer
            .pace("hello", |piece| piece, |piece| piece)
            .collect()
            .await;
        assert_eq!(frames.len(), 5);
        assert_eq!(frames.concat(), "hello");
    }

    #[tokio::test]
    async fn block_mode_round_trips_at_long_threshold() {
        let pacer = pacer(0, 0, 1, 4, 3);
        let frames: Vec<String> = pacer
            .pace("abcdefgh", |piece| piece, |piece| piece)
            .collect()
            .await;
        assert_eq!(frames, vec!["abc", "def", "gh"]);
        assert_eq!(frames.concat(), "abcdefgh");
    }

    #[tokio::test]
    async fn empty_text_emits_nothing() {
        let pacer = pacer(0, 0, 2, 4, 2);
        let frames: Vec<String> = pacer.pace("", |piece| piece, |piece| piece).collect().await;
        assert!(frames.is_empty());
    }
}
