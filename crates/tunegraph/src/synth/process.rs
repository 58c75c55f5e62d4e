use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};

use super::{SynthesisRequest, SynthesisResponse, Synthesizer};
use crate::env;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct ImportFailure {
    reason: String,
}

type ImportCell = OnceLock<std::result::Result<PathBuf, ImportFailure>>;
type ImportKey = (String, Vec<PathBuf>);

/// Import outcomes for the whole process, one per tool name and search path.
static IMPORTS: OnceLock<Mutex<HashMap<ImportKey, Arc<ImportCell>>>> = OnceLock::new();

fn shared_import(tool: &str, search_path: &[PathBuf]) -> Arc<ImportCell> {
    let mut imports = IMPORTS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .expect("synthesizer import table poisoned");
    Arc::clone(
        imports
            .entry((tool.to_string(), search_path.to_vec()))
            .or_default(),
    )
}

/// Synthesizer backed by an external executable speaking the JSON protocol:
/// `<tool> synthesize` reads one request from stdin and writes one response
/// to stdout.
///
/// The executable is located and probed once per process for a given tool
/// name and search path; every synthesizer sharing them reuses that outcome,
/// so calls after a successful import only pay for the subprocess.
pub struct ProcessSynthesizer {
    tool: String,
    search_path: Vec<PathBuf>,
    session: OnceLock<Arc<ImportCell>>,
}

impl ProcessSynthesizer {
    pub fn new(tool: impl Into<String>, search_path: Vec<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            search_path,
            session: OnceLock::new(),
        }
    }

    /// Tool name from `TUNEGRAPH_SYNTH`, search path from `TUNEGRAPH_SYNTH_PATH`.
    pub fn from_env() -> Self {
        Self::new(env::synth_tool_name(), env::synth_search_path())
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    fn remediation_hint(&self) -> String {
        format!(
            "set {} to contain the directory holding `{}` (e.g. <repo-root>/target/debug after `cargo build -p tunesynth`)",
            env::SYNTH_PATH_VAR,
            self.tool
        )
    }

    /// Resolved executable, importing it on first use.
    pub fn session(&self) -> Result<&Path> {
        let cell = self
            .session
            .get_or_init(|| shared_import(&self.tool, &self.search_path));
        let init = cell.get_or_init(|| import_tool(&self.tool, &self.search_path));
        match init {
            Ok(path) => Ok(path.as_path()),
            Err(failure) => {
                let hint = self.remediation_hint();
                tracing::error!(tool = %self.tool, reason = %failure.reason, "{hint}");
                Err(Error::ExternalToolImport {
                    tool: self.tool.clone(),
                    reason: failure.reason.clone(),
                    hint,
                })
            }
        }
    }
}

fn executable_name(tool: &str) -> String {
    format!("{tool}{}", std::env::consts::EXE_SUFFIX)
}

fn import_tool(tool: &str, search_path: &[PathBuf]) -> std::result::Result<PathBuf, ImportFailure> {
    if search_path.is_empty() {
        return Err(ImportFailure {
            reason: format!("{} is not set", env::SYNTH_PATH_VAR),
        });
    }
    let name = executable_name(tool);
    let Some(path) = search_path
        .iter()
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
    else {
        let searched: Vec<String> = search_path.iter().map(|p| p.display().to_string()).collect();
        return Err(ImportFailure {
            reason: format!("`{name}` not found in [{}]", searched.join(", ")),
        });
    };

    let output = Command::new(&path)
        .arg("version")
        .output()
        .map_err(|err| ImportFailure {
            reason: format!("failed to run {}: {err}", path.display()),
        })?;
    if !output.status.success() {
        return Err(ImportFailure {
            reason: format!(
                "{} version exited with {}: {}",
                path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    tracing::debug!(
        tool = %path.display(),
        version = %String::from_utf8_lossy(&output.stdout).trim(),
        "imported external synthesizer"
    );
    Ok(path)
}

impl Synthesizer for ProcessSynthesizer {
    fn name(&self) -> &str {
        &self.tool
    }

    fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse> {
        let path = self.session()?;
        let payload = serde_json::to_vec(request)?;

        let mut child = Command::new(path)
            .arg("synthesize")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::synthesis(format!("failed to run {}: {err}", path.display())))?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(&payload) {
                drop(stdin);
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::synthesis(format!(
                    "failed to send request {} to {}: {err}",
                    request.func_name,
                    path.display()
                )));
            }
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::synthesis(format!(
                "{} synthesize failed for {} (status={}): {}",
                self.tool,
                request.func_name,
                output.status,
                stderr.trim()
            )));
        }
        serde_json::from_slice(&output.stdout).map_err(|err| {
            Error::synthesis(format!("{} returned a malformed response: {err}", self.tool))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::SynthTarget;

    #[test]
    fn missing_search_path_reports_hint() {
        let synth = ProcessSynthesizer::new("tunesynth", Vec::new());
        let err = synth.session().unwrap_err();
        match err {
            Error::ExternalToolImport { tool, reason, hint } => {
                assert_eq!(tool, "tunesynth");
                assert!(reason.contains(env::SYNTH_PATH_VAR));
                assert!(hint.contains(env::SYNTH_PATH_VAR));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn import_outcome_is_shared_across_synthesizers() {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("tunegraph_shared_import_{stamp}"));
        std::fs::create_dir_all(&dir).unwrap();

        let first = ProcessSynthesizer::new("late-synth", vec![dir.clone()]);
        let reason = match first.session() {
            Err(Error::ExternalToolImport { reason, .. }) => reason,
            other => panic!("unexpected import result: {other:?}"),
        };
        assert!(reason.contains("not found"));

        // A tool appearing later does not trigger a second import.
        std::fs::write(dir.join(executable_name("late-synth")), b"").unwrap();
        let second = ProcessSynthesizer::new("late-synth", vec![dir.clone()]);
        match second.session() {
            Err(Error::ExternalToolImport { reason: again, .. }) => assert_eq!(again, reason),
            other => panic!("unexpected import result: {other:?}"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn tool_exiting_before_reading_is_a_synthesis_error() {
        let synth = ProcessSynthesizer::new(
            "true",
            vec![PathBuf::from("/bin"), PathBuf::from("/usr/bin")],
        );
        let request = SynthesisRequest {
            input_shapes: vec![vec![4, 4]],
            input_dtypes: vec!["float32".to_string()],
            output_shape: vec![4, 4],
            output_dtype: "float32".to_string(),
            expression: "x".repeat(1 << 20),
            func_name: "mem_bound_3".to_string(),
            input_names: vec!["var_1".to_string()],
            output_name: "var_2".to_string(),
            target: SynthTarget::default(),
        };
        match synth.synthesize(&request) {
            Err(Error::Synthesis(message)) => {
                assert!(message.contains("mem_bound_3"), "{message}");
            }
            other => panic!("unexpected synthesis result: {other:?}"),
        }
    }

    #[test]
    fn unresolvable_tool_fails_every_call() {
        let dir = std::env::temp_dir().join("tunegraph_no_such_synth_dir");
        let synth = ProcessSynthesizer::new("definitely-not-a-synth", vec![dir]);
        assert!(matches!(
            synth.session(),
            Err(Error::ExternalToolImport { .. })
        ));
        assert!(matches!(
            synth.session(),
            Err(Error::ExternalToolImport { .. })
        ));
    }
}
