// warden-daemon: per-host agent owning GPUs and worker processes.
//
// The daemon enumerates its GPUs at startup, registers them with the fleet
// manager, and serves SpawnWorker requests by forking worker processes
// pinned to a GPU uuid. One supervisor task per child mirrors worker exits
// back to the manager.

pub mod config;
pub mod manager_client;
pub mod probe;
pub mod server;
pub mod supervise;
