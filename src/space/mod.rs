//! Space registry and on-disk metadata
//!
//! Each space lives in `<base_dir>/<name>/` and carries its metadata as
//! small marker files:
//!
//! | File | Meaning |
//! |------|---------|
//! | `space_spec.yaml` | Spec text of the last successful build |
//! | `space_spec_path` | Source path of that spec |
//! | `state` | `created`, `environment_requested` or `environment_ready` |
//! | `damaged` | Present when the space must not be used |
//! | `space_env.json` | Environment captured by the builder |
//! | `requested_pid` | Last requester, diagnostic only |
//! | `last_usage` | Modification time is the last-usage timestamp |
//! | `time_<epoch>` | Legacy usage markers, folded into `last_usage` |

pub mod record;
pub mod registry;

pub use record::{
    files, EnvironmentSpec, SpaceName, SpaceRecord, SpaceStatus, TOOLCHAIN_ROOT_KEY,
};
pub use registry::{CapturedEnv, SpaceRegistry};
