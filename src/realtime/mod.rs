//! Realtime transport: websocket connection management, wire frames, and
//! subscription bookkeeping.
//!
//! The connection speaks a small publish/subscribe framing protocol: one topic
//! per destination string, JSON-encoded frames, text bodies. The server speaks
//! first after the upgrade, accepting the session with `connected` or
//! rejecting it with `error`.

/// Connection state machine, subscription registry, and reconnection.
pub mod connection;
/// Wire frame types exchanged with the server.
pub mod frame;
