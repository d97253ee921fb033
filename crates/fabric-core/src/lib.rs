//! Shared protocol-agnostic types for the reverse-tunnel proxy fabric:
//! errors, the buffered-prefix stream wrapper, ticket generation, and
//! the domain/traffic trait boundaries the edge and agent both depend
//! on.

pub mod domain;
pub mod error;
pub mod http;
pub mod io;
pub mod ticket;
pub mod traffic;

pub use domain::{DomainRecord, DomainStore, StaticDomainStore, TtlCachedStore};
pub use error::{FabricError, FabricResult};
pub use http::{bad_gateway_response, classify, header_value, host_without_port, Classification};
pub use io::{read_until_headers_end, BoxedDuplex, Duplex, PrefixedStream};
pub use ticket::{Ticket, TicketGenerator};
pub use traffic::{LoggingTrafficSink, NullTrafficSink, TrafficSink};
