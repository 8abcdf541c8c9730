//! Notification handling for the serial characteristic
//! Decodes notification payloads as UTF-8, runs them through the line framer and
//! publishes each completed line to the link's listeners.

use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::link_config::FramerConfig;
use crate::core::bluetooth::error::PlatformFailure;
use crate::core::bluetooth::transport::NotificationStream;
use crate::core::bluetooth::types::LinkEvent;
use crate::core::events::EventBus;
use crate::core::framer::LineFramer;

/// Why a notification pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The link asked the pump to stop.
    Cancelled,
    /// The platform closed the stream: the peripheral went away.
    Closed,
    Failed(PlatformFailure),
}

/// Incremental UTF-8 decoding. A multi-byte character split across two
/// notifications is held back until its remaining bytes arrive.
#[derive(Debug, Default)]
struct Utf8Decoder {
    tail: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        let input = [std::mem::take(&mut self.tail).as_slice(), bytes].concat();
        let mut text = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.tail = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    fn finish(&mut self) -> String {
        let tail = std::mem::take(&mut self.tail);
        String::from_utf8_lossy(&tail).into_owned()
    }
}

/// Notification handler for serial output
#[derive(Clone)]
pub struct NotificationHandler {
    framer: FramerConfig,
    idle_flush: Duration,
    events: EventBus<LinkEvent>,
}

impl NotificationHandler {
    pub fn new(framer: FramerConfig, idle_flush: Duration, events: EventBus<LinkEvent>) -> Self {
        Self {
            framer,
            idle_flush,
            events,
        }
    }

    /// Processes notifications until the stream ends or `cancel_token` fires.
    ///
    /// A partial line is flushed to listeners after `idle_flush` of silence, so
    /// prompts without a terminator still show up.
    pub async fn pump(&self, mut stream: NotificationStream, cancel_token: CancellationToken) -> StreamEnd {
        info!("Listening for serial notifications...");
        let mut framer = LineFramer::new(&self.framer);
        let mut decoder = Utf8Decoder::default();

        loop {
            let idle = framer.has_pending().then_some(self.idle_flush);
            let idle_timer = async move {
                match idle {
                    Some(period) => tokio::time::sleep(period).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Notification pump cancelled");
                    return StreamEnd::Cancelled;
                }
                _ = idle_timer => {
                    self.publish(framer.flush());
                }
                item = stream.next() => match item {
                    Some(Ok(value)) => {
                        debug!("Received notification: {:?}", value);
                        let text = decoder.decode(&value);
                        self.publish(framer.push(&text));
                    }
                    Some(Err(failure)) => {
                        warn!("Error in notification stream: {}", failure);
                        self.drain(&mut framer, &mut decoder);
                        return StreamEnd::Failed(failure);
                    }
                    None => {
                        info!("Notification stream ended");
                        self.drain(&mut framer, &mut decoder);
                        return StreamEnd::Closed;
                    }
                }
            }
        }
    }

    fn drain(&self, framer: &mut LineFramer, decoder: &mut Utf8Decoder) {
        let tail = decoder.finish();
        let mut lines = framer.push(&tail);
        lines.extend(framer.flush());
        self.publish(lines);
    }

    fn publish(&self, lines: Vec<String>) {
        for line in lines {
            self.events.publish(&LinkEvent::Line(line));
        }
    }
}
