//! The Taskify server.
//!
//! | Module      | Responsibility                                        |
//! |-------------|-------------------------------------------------------|
//! | `models`    | Domain types shared by storage, API and events        |
//! | `db`        | SQLite persistence behind a blocking-pool handle      |
//! | `api`       | REST routes under `/api/v1` and the shared state      |
//! | `realtime`  | Room registry, event types and the socket loop        |
//! | `messaging` | Chat writes shared by REST and socket callers         |
//! | `server`    | Router assembly, CORS, startup and shutdown           |

pub mod api;
pub mod db;
pub mod messaging;
pub mod models;
pub mod realtime;
pub mod server;
