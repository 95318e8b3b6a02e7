//! Stream ingestion adapter.
//!
//! Frames travel as newline-delimited JSON over any `AsyncRead`/`AsyncWrite`
//! pair. The reader task decodes inbound frames and forwards them to the
//! session worker; the writer task serialises outbound frames. Chunked tensor
//! payloads are reassembled by [`reassembly::Reassembler`].
//!
//! Submodules:
//! - `codec`: line framing with a maximum frame size.
//! - `frames`: inbound and outbound frame types.
//! - `reader`: read task emitting [`reader::StreamEvent`]s.
//! - `writer`: write task draining outbound frames.
//! - `reassembly`: chunk reassembly with incremental statistics.

pub mod codec;
pub mod frames;
pub mod reader;
pub mod reassembly;
pub mod writer;
