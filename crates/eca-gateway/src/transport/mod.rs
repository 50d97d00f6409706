//! Transport layer: WebSocket upgrade and text-frame helpers.

pub mod websocket;
