/// Heart rate monitor profile. Every broadcast page carries the current
/// heart rate in its last four bytes; the page number in byte zero (with
/// a toggle bit legacy devices flip every four messages) selects what the
/// first four bytes mean. Only page 4 matters for beat timing; the rest
/// are background identification pages.
use crate::channel::{ChannelHandler, Config};
use crate::device::ANTPLUS_FREQUENCY;
use crate::message::bytes_to_u16;

pub const HEART_RATE_DEVICE_TYPE: u8 = 0x78;
pub const HEART_RATE_PERIOD: u16 = 8070;

const PAGE_TOGGLE_MASK: u8 = 0x7F;
const PAGE_PREVIOUS_BEAT: u8 = 0x04;

// Beat times are transmitted in 1/1024s units.
const BEAT_TIME_SCALE: f32 = 1024.0;

/// One decoded heart rate sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeartRateData {
    /// Computed heart rate in beats per minute.
    pub heart_rate: u8,
    /// Running beat counter, wrapping at 255.
    pub beat_count: u8,
    /// Time of the last beat event, seconds.
    pub beat_time: f32,
    /// Time of the beat before it, seconds. Only transmitted on page 4.
    pub previous_beat_time: f32,
}

/// Channel handler decoding heart rate broadcasts. Each new beat is
/// handed to the data callback; pages repeating an already-reported beat
/// count are suppressed, since monitors rebroadcast between beats.
pub struct HeartRate {
    data: HeartRateData,
    last_beat_count: Option<u8>,
    on_data: Box<dyn FnMut(&HeartRateData) + Send>,
}

impl HeartRate {
    pub fn new(on_data: Box<dyn FnMut(&HeartRateData) + Send>) -> Self {
        HeartRate {
            data: HeartRateData::default(),
            last_beat_count: None,
            on_data,
        }
    }

    /// Channel configuration for a heart rate monitor. A device id of 0
    /// pairs with the first monitor found.
    pub fn config(device_id: u16, transmission_type: u8) -> Config {
        Config::new()
            .device_id(device_id)
            .device_type(HEART_RATE_DEVICE_TYPE)
            .transmission_type(transmission_type)
            .frequency(ANTPLUS_FREQUENCY)
            .period(HEART_RATE_PERIOD)
    }

    fn decode_page(&mut self, page: &[u8]) {
        if page[0] & PAGE_TOGGLE_MASK == PAGE_PREVIOUS_BEAT {
            self.data.previous_beat_time = bytes_to_u16(&page[2..4]) as f32 / BEAT_TIME_SCALE;
        }
        self.data.beat_time = bytes_to_u16(&page[4..6]) as f32 / BEAT_TIME_SCALE;
        self.data.beat_count = page[6];
        self.data.heart_rate = page[7];
    }
}

impl ChannelHandler for HeartRate {
    fn on_broadcast(&mut self, payload: &[u8]) {
        let page = match payload.get(..8) {
            Some(page) => page,
            None => return,
        };
        self.decode_page(page);
        if self.last_beat_count == Some(self.data.beat_count) {
            return;
        }
        self.last_beat_count = Some(self.data.beat_count);
        (self.on_data)(&self.data);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_monitor() -> (HeartRate, Arc<Mutex<Vec<HeartRateData>>>) {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        let monitor = HeartRate::new(Box::new(move |data| {
            sink.lock().unwrap().push(data.clone());
        }));
        (monitor, samples)
    }

    #[test]
    fn config_matches_the_profile() {
        let config = HeartRate::config(0x1234, 1);
        assert_eq!(config, Config::new()
            .device_id(0x1234)
            .device_type(0x78)
            .transmission_type(1)
            .frequency(0x39)
            .period(8070));
    }

    #[test]
    fn decodes_beat_fields_from_any_page() {
        let (mut monitor, samples) = recording_monitor();
        // Page 0, beat time 1024 (1.0s), beat count 10, 72 bpm.
        monitor.on_broadcast(&[0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x04, 10, 72]);
        let samples = samples.lock().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].heart_rate, 72);
        assert_eq!(samples[0].beat_count, 10);
        assert!((samples[0].beat_time - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn page_four_carries_previous_beat_time() {
        let (mut monitor, samples) = recording_monitor();
        // Toggle bit set on the page number; previous beat at 0.5s.
        monitor.on_broadcast(&[0x84, 0xFF, 0x00, 0x02, 0x00, 0x04, 11, 70]);
        let samples = samples.lock().unwrap();
        assert!((samples[0].previous_beat_time - 0.5).abs() < f32::EPSILON);
        assert!((samples[0].beat_time - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn rebroadcasts_of_the_same_beat_are_suppressed() {
        let (mut monitor, samples) = recording_monitor();
        monitor.on_broadcast(&[0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x04, 10, 72]);
        monitor.on_broadcast(&[0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x04, 10, 72]);
        monitor.on_broadcast(&[0x00, 0xFF, 0xFF, 0xFF, 0x80, 0x04, 11, 73]);
        assert_eq!(samples.lock().unwrap().len(), 2);
    }

    #[test]
    fn short_payload_is_ignored() {
        let (mut monitor, samples) = recording_monitor();
        monitor.on_broadcast(&[0x00, 0x01]);
        assert!(samples.lock().unwrap().is_empty());
    }
}
