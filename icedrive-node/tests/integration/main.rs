//! Integration tests running whole nodes over loopback TCP.

mod helpers;

mod tcp_federation;
