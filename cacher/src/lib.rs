//! # Source Engine Query Cacher
//!
//! A caching UDP reverse-proxy for the Source Engine server-query protocol.
//! It sits between the open internet and a single game server, absorbing
//! A2S_INFO, A2S_PLAYER and A2S_RULES traffic so that query floods are
//! answered from memory instead of reaching the game server.
//!
//! ## How Requests Are Served
//!
//! Every client goes through a two-phase handshake. The first request is
//! answered with a random per-IP challenge code; the client repeats the
//! request carrying that code and, if it matches, receives the cached reply.
//! Because the code must arrive from the address it was issued to, spoofed
//! source addresses never complete the handshake and never trigger an
//! amplified reply.
//!
//! Cached replies are refreshed continuously: one poller per query kind
//! performs the same handshake against the real game server on a fixed
//! interval and swaps the stored payload atomically. Client traffic is
//! dropped until all three kinds have been fetched at least once.
//!
//! ## Module Organization
//!
//! - [`config`]: runtime knobs, loaded from CLI flags and an optional
//!   JSON file
//! - [`challenge`]: the per-IP challenge code cache with its TTL sweeper
//! - [`response`]: the atomically swapped payload slot per query kind
//! - [`handler`]: per-datagram dispatch tying the caches together
//! - [`poller`]: the upstream refresh task for one query kind
//! - [`network`]: the client-facing UDP socket and its task pool
//! - [`stats`]: optional packets/bits-per-second counters
//!
//! All state shared between tasks is either sharded ([`dashmap`]), swapped
//! atomically ([`arc_swap`]) or a plain atomic counter; there is no global
//! lock on the datagram path.

pub mod challenge;
pub mod config;
pub mod handler;
pub mod network;
pub mod poller;
pub mod response;
pub mod stats;
