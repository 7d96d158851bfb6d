//! Subprocess-backed builder
//!
//! Invokes the configured builder executable:
//! - `<program> hash --stdin --source <spec_path>` with the spec text on stdin,
//!   printing the hash on stdout
//! - `<program> build --spec <spec_path> --target <dir> --env-out <file>`,
//!   writing the captured environment as a JSON object to `<file>`

use crate::builder::{BuildOutput, SpaceBuilder};
use crate::config::schema::BuilderConfig;
use crate::error::{SpaceError, SpaceResult};
use crate::space::CapturedEnv;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Scratch file the builder writes its captured environment to
const ENV_OUT_FILE: &str = ".captured_env.json";

/// Builder running an external executable
pub struct CommandBuilder {
    program: PathBuf,
    build_timeout: Duration,
    hash_timeout: Duration,
}

impl CommandBuilder {
    pub fn new(program: impl Into<PathBuf>, build_timeout: Duration, hash_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            build_timeout,
            hash_timeout,
        }
    }

    pub fn from_config(config: &BuilderConfig) -> Self {
        Self::new(
            &config.program,
            Duration::from_secs(config.build_timeout_secs),
            Duration::from_secs(config.hash_timeout_secs),
        )
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.program.display(), args.join(" "))
    }
}

#[async_trait]
impl SpaceBuilder for CommandBuilder {
    async fn hash(&self, spec_text: &str, spec_path: &Path) -> SpaceResult<String> {
        let source = spec_path.to_string_lossy();
        let args = ["hash", "--stdin", "--source", source.as_ref()];
        let command = self.describe(&args);
        debug!("Executing: {}", command);

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpaceError::command_failed(&command, e))?;

        // Writing stdin counts against the hash timeout too.
        let exchange = async {
            if let Some(mut stdin) = child.stdin.take() {
                match stdin.write_all(spec_text.as_bytes()).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        debug!("{} exited without reading its input", command);
                    }
                    Err(e) => return Err(e),
                }
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.hash_timeout, exchange)
            .await
            .map_err(|_| SpaceError::CommandTimeout {
                command: command.clone(),
                timeout_secs: self.hash_timeout.as_secs(),
            })?
            .map_err(|e| SpaceError::command_failed(&command, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SpaceError::Hash(stderr.trim().to_string()));
        }

        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if hash.is_empty() {
            return Err(SpaceError::Hash(format!("{} printed no hash", command)));
        }
        Ok(hash)
    }

    async fn build(&self, spec_path: &Path, target_dir: &Path) -> SpaceResult<BuildOutput> {
        let env_out = target_dir.join(ENV_OUT_FILE);
        let spec = spec_path.to_string_lossy();
        let target = target_dir.to_string_lossy();
        let env_out_arg = env_out.to_string_lossy();
        let args = [
            "build",
            "--spec",
            spec.as_ref(),
            "--target",
            target.as_ref(),
            "--env-out",
            env_out_arg.as_ref(),
        ];
        let command = self.describe(&args);
        info!("Building space: {}", command);

        let output = tokio::time::timeout(
            self.build_timeout,
            Command::new(&self.program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| SpaceError::CommandTimeout {
            command: command.clone(),
            timeout_secs: self.build_timeout.as_secs(),
        })?
        .map_err(|e| SpaceError::command_failed(&command, e))?;

        let captured_env = match tokio::fs::read_to_string(&env_out).await {
            Ok(content) => {
                let _ = tokio::fs::remove_file(&env_out).await;
                serde_json::from_str::<CapturedEnv>(&content)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CapturedEnv::new(),
            Err(e) => {
                return Err(SpaceError::io(format!("reading {}", env_out.display()), e));
            }
        };

        Ok(BuildOutput {
            success: output.status.success(),
            captured_env,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn builder_name(&self) -> &'static str {
        "command"
    }
}
