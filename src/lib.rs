//! # chatshard
//!
//! Streams very large chat logs into a self-contained static bundle that a
//! browser can open straight from disk, without ever holding the whole log
//! in memory.
//!
//! One pass over the records produces size- and count-bounded shard files,
//! a Bloom-filter text index per shard, a hash-bucketed record id index,
//! copies of referenced media, and a manifest tying it all together.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────────┐
//! │ RecordSource│──▶│ Render   │──▶│ShardRotator │──▶│ data/chunks  │
//! │ JSONL/Vec/  │   │ (HTML)   │   │ + Bloom     │   └──────────────┘
//! │ Stream      │   └──────────┘   └──────┬──────┘   ┌──────────────┐
//! └─────────────┘                         ├────────▶│ data/index   │
//!                                         │          └──────────────┘
//!                                         │          ┌──────────────┐
//!                                         ├────────▶│ resources/   │
//!                                         ▼          └──────────────┘
//!                                  ┌─────────────┐
//!                                  │  Manifest   │  data/manifest.json
//!                                  └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chatshard export --input chat.jsonl --out ./bundle --chat-id 42
//! chatshard inspect ./bundle
//! chatshard lookup ./bundle 7391
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`writer`] | Bounded-memory batched writer with backpressure |
//! | [`hash`] | FNV-1a and djb2 hash functions shared with viewers |
//! | [`bloom`] | Bloom filters and n-gram text indexing |
//! | [`shard`] | Shard writer and rotation state machine |
//! | [`id_index`] | Hash-bucketed record id index |
//! | [`resources`] | Resource lookup and bounded copy scheduler |
//! | [`manifest`] | Manifest assembly and writing |
//! | [`export`] | Export pass orchestration |
//! | [`inspect`] | Bundle summary and id lookup |
//! | [`models`] | Records, elements, resource references |
//! | [`render`] | Record rendering |
//! | [`source`] | Record sources |
//! | [`bundle`] | Bundle directory layout |
//! | [`progress`] | Progress reporting |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error types |

pub mod bloom;
pub mod bundle;
pub mod config;
pub mod error;
pub mod export;
pub mod hash;
pub mod id_index;
pub mod inspect;
pub mod manifest;
pub mod models;
pub mod progress;
pub mod render;
pub mod resources;
pub mod shard;
pub mod source;
pub mod writer;
