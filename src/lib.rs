//! # graph-rag
//!
//! **A hybrid retrieval question-answering engine.**
//!
//! graph-rag ingests heterogeneous documents, indexes them into a dense
//! vector space plus a typed knowledge graph, and answers natural-language
//! queries by routing each one between two retrieval strategies: a fast
//! vector-only path (speed) and a graph-expanded multi-hop path (deep).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────────────┐   ┌───────────────┐
//! │ Ingest  │──▶│ Chunker + Embed  │──▶│ SQLite store  │
//! │ API/CLI │   │ + Entity mining  │   │ Vector index  │
//! └─────────┘   └──────────────────┘   │ Knowl. graph  │
//!                                      └──────┬────────┘
//!                 ┌───────────────────────────┤
//!                 ▼                           ▼
//!           ┌───────────┐             ┌──────────────┐
//!           │ Speed     │             │ Deep         │
//!           │ retriever │             │ retriever    │
//!           └─────┬─────┘             └──────┬───────┘
//!                 └───────────┬──────────────┘
//!                             ▼
//!                      ┌─────────────┐
//!                      │ Hybrid      │──▶ answer + confidence
//!                      │ engine (LM) │    + provenance
//!                      └─────────────┘
//! ```
//!
//! ## Query Flow
//!
//! 1. The **mode selector** ([`mode`]) scores the query's complexity from
//!    lexical signals plus an LM intent classification and picks speed or
//!    deep retrieval.
//! 2. **Speed** ([`retriever_speed`]) searches the vector index and hydrates
//!    hits from the chunk store.
//! 3. **Deep** ([`retriever_deep`]) additionally mines the query for
//!    entities, walks the knowledge graph outward, and pulls in chunks for
//!    entities the initial hits missed.
//! 4. The **hybrid engine** ([`engine`]) has the LM synthesize an answer
//!    from the assembled context, scores a deterministic confidence, and
//!    appends a provenance row.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: `Document`, `Chunk`, `Entity`, `RetrievalResult` |
//! | [`chunker`] | Fixed-window chunker with character offsets |
//! | [`embedding`] | Embedding provider trait, HTTP + deterministic hash backends |
//! | [`vector_index`] | Flat L2 index with atomic snapshots |
//! | [`graph`] | Knowledge graph with bounded simple-path search |
//! | [`llm`] | LM client: generation, streaming, intent, entity extraction |
//! | [`mode`] | Speed/deep mode selector |
//! | [`retriever_speed`] | Vector-only retrieval and context assembly |
//! | [`retriever_deep`] | Graph-expanded retrieval |
//! | [`engine`] | Mode dispatch, synthesis, confidence, provenance |
//! | [`extract`] | Text-extraction seam for ingest sources |
//! | [`ingest`] | Ingestion and deletion pipelines |
//! | [`store`] | Chunk store operations over SQLite |
//! | [`context`] | Application context wiring |
//! | [`server`] | JSON HTTP API (Axum) |
//! | [`status`] | System status and metrics payloads |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema migrations (idempotent) |

pub mod chunker;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod graph;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod mode;
pub mod models;
pub mod retriever_deep;
pub mod retriever_speed;
pub mod server;
pub mod status;
pub mod store;
pub mod vector_index;
