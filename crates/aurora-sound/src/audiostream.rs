//! PCM stream abstractions.
//!
//! Decoders produce interleaved host-endian `i16` samples. The queuing
//! stream is the hand-off point between a packet decoder (the only
//! producer) and whatever drains the PCM (the only consumer); it performs
//! no synchronization of its own.

use std::collections::VecDeque;

/// A readable stream of interleaved 16-bit PCM.
pub trait AudioStream {
    fn channels(&self) -> usize;
    fn rate(&self) -> u32;

    /// Fill `buffer` with up to `buffer.len()` samples; returns how many
    /// were written.
    fn read_buffer(&mut self, buffer: &mut [i16]) -> usize;

    /// No samples are currently available.
    fn end_of_data(&self) -> bool;

    /// No samples are available and none will ever be.
    fn end_of_stream(&self) -> bool;
}

/// An [`AudioStream`] fed by discrete compressed packets.
pub trait PacketizedAudioStream: AudioStream {
    /// Decode one packet and queue its PCM. The packet is consumed
    /// end-to-end and never retained.
    fn queue_packet(&mut self, data: &[u8]);

    /// Signal that no more packets will arrive.
    fn finish(&mut self);

    fn is_finished(&self) -> bool;
}

/// A FIFO of decoded PCM buffers.
pub struct QueuingAudioStream {
    rate: u32,
    channels: usize,
    queue: VecDeque<Vec<i16>>,
    /// Read offset into the front buffer.
    front_pos: usize,
    finished: bool,
}

impl QueuingAudioStream {
    pub fn new(rate: u32, channels: usize) -> Self {
        Self {
            rate,
            channels,
            queue: VecDeque::new(),
            front_pos: 0,
            finished: false,
        }
    }

    /// Append a buffer of interleaved samples to the queue.
    pub fn queue_buffer(&mut self, buffer: Vec<i16>) {
        if !buffer.is_empty() {
            self.queue.push_back(buffer);
        }
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl AudioStream for QueuingAudioStream {
    fn channels(&self) -> usize {
        self.channels
    }

    fn rate(&self) -> u32 {
        self.rate
    }

    fn read_buffer(&mut self, buffer: &mut [i16]) -> usize {
        let mut written = 0;
        while written < buffer.len() {
            let Some(front) = self.queue.front() else {
                break;
            };

            let avail = front.len() - self.front_pos;
            let n = avail.min(buffer.len() - written);
            buffer[written..written + n]
                .copy_from_slice(&front[self.front_pos..self.front_pos + n]);
            written += n;
            self.front_pos += n;

            if self.front_pos == front.len() {
                self.queue.pop_front();
                self.front_pos = 0;
            }
        }
        written
    }

    fn end_of_data(&self) -> bool {
        self.queue.is_empty()
    }

    fn end_of_stream(&self) -> bool {
        self.finished && self.end_of_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_across_queued_buffers() {
        let mut stream = QueuingAudioStream::new(44100, 2);
        stream.queue_buffer(vec![1, 2, 3]);
        stream.queue_buffer(vec![4, 5]);

        let mut out = [0i16; 4];
        assert_eq!(stream.read_buffer(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);

        let mut out = [0i16; 4];
        assert_eq!(stream.read_buffer(&mut out), 1);
        assert_eq!(out[0], 5);
        assert!(stream.end_of_data());
    }

    #[test]
    fn empty_buffers_are_dropped() {
        let mut stream = QueuingAudioStream::new(22050, 1);
        stream.queue_buffer(Vec::new());
        assert!(stream.end_of_data());
    }

    #[test]
    fn end_of_stream_needs_finish_and_drain() {
        let mut stream = QueuingAudioStream::new(22050, 1);
        stream.queue_buffer(vec![7]);
        assert!(!stream.end_of_stream());

        stream.finish();
        assert!(stream.is_finished());
        assert!(!stream.end_of_stream());

        let mut out = [0i16; 1];
        stream.read_buffer(&mut out);
        assert!(stream.end_of_stream());
    }
}
