/// Native module contains implementations of core traits
/// that drive processes with plain syscalls (namespaces, bind
/// mounts, rlimits, subreapers) instead of Docker or Runc.
pub mod executor;
mod jail;
mod tree;
