//! Realtime feed: a WebSocket push stream of monitor telemetry.
//!
//! [`RealtimeClient::stream`] dials the feed for one monitor and hands every decoded
//! [`Message`] to a [`Handler`] in arrival order. The handler decides whether to
//! continue, stop, or fail the session via [`Flow`].

mod client;
mod conn;
mod message;
mod reporter;
mod session;
pub mod testing;

pub use client::{RealtimeClient, StreamError, DEFAULT_ORIGIN, DEFAULT_REALTIME_URL};
pub use conn::{
    CloseCode, Connection, DialOptions, Dialer, Frame, Handshake, TransportError, WsConnection,
    WsDialer, DEFAULT_CLOSE_TIMEOUT,
};
pub use message::{
    parse_message, DataChange, DecodeError, Decoder, Delta, Device, DeviceState, DeviceStates,
    GoalEvent, Hello, Message, MonitorInfo, NewDeviceFound, NewTimelineEvent, PendingEvents,
    PowerFlow, RealtimeUpdate, Stats, TimelineEvent,
};
pub use reporter::DecodeReporter;
pub use session::{Flow, Handler};
