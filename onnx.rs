use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

#[cfg(target_os = "windows")]
use ort::execution_providers::{DirectMLExecutionProvider, ExecutionProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceProvider {
    Cpu,
    DirectML { device_id: u32 },
}

impl InferenceProvider {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::DirectML { .. } => "GPU (DirectML)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChoice {
    Auto,
    #[serde(rename = "cpu")]
    CpuOnly,
    #[serde(rename = "directml")]
    DirectMLOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct OrtRuntimeConfig {
    pub provider: ProviderChoice,
    pub device_id: Option<u32>,
}

impl OrtRuntimeConfig {
    fn resolved_device_id(self) -> u32 {
        self.device_id.unwrap_or(0)
    }
}

#[cfg(target_os = "windows")]
fn prepend_path_dir(dir: &Path) {
    let paths = std::env::var_os("PATH").unwrap_or_default();
    let mut new_paths = std::ffi::OsString::new();
    new_paths.push(dir);
    new_paths.push(";");
    new_paths.push(&paths);
    std::env::set_var("PATH", new_paths);
}

/// `ORT_DYLIB_PATH` first, then an `onnxruntime/` folder next to the executable.
#[cfg(target_os = "windows")]
fn resolve_ort_dylib_path() -> Option<(std::path::PathBuf, std::path::PathBuf)> {
    if let Ok(path) = std::env::var("ORT_DYLIB_PATH") {
        let path = std::path::PathBuf::from(path);
        if path.exists() {
            let dir = path.parent()?.to_path_buf();
            return Some((path, dir));
        }
    }
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join("onnxruntime").join("onnxruntime.dll");
    if candidate.exists() {
        let dir = candidate.parent()?.to_path_buf();
        return Some((candidate, dir));
    }
    None
}

fn ensure_environment() -> Result<()> {
    let committed = ort::init()
        .with_name("hybrid-tagger")
        .commit()
        .map_err(|e| Error::Init(format!("Failed to init ORT environment: {e}")))?;
    if committed {
        if let Ok(env) = ort::environment::get_environment() {
            env.set_log_level(ort::logging::LogLevel::Warning);
        }
    }
    Ok(())
}

/// Builds a session for `model_path`, preferring DirectML when asked for and available.
/// A missing model file is a startup error, never a per-image one.
pub fn build_session(
    model_path: &Path,
    cfg: OrtRuntimeConfig,
) -> Result<(Session, InferenceProvider)> {
    if !model_path.exists() {
        return Err(Error::Init(format!(
            "Model not found: {}",
            model_path.display()
        )));
    }
    #[cfg(target_os = "windows")]
    {
        if let Some((dll_path, dll_dir)) = resolve_ort_dylib_path() {
            std::env::set_var("ORT_DYLIB_PATH", &dll_path);
            prepend_path_dir(&dll_dir);
        } else {
            return Err(Error::Init(
                "onnxruntime.dll not found; set ORT_DYLIB_PATH".into(),
            ));
        }
    }
    ensure_environment()?;
    let device_id = cfg.resolved_device_id();

    let try_build = |use_dml: bool| -> Result<Session> {
        let build = || -> Result<Session> {
            #[allow(unused_mut)]
            let mut builder = Session::builder()
                .map_err(|e| Error::Init(format!("{e}")))?
                .with_optimization_level(GraphOptimizationLevel::Level1)
                .map_err(|e| Error::Init(format!("{e}")))?
                .with_parallel_execution(false)
                .map_err(|e| Error::Init(format!("{e}")))?;
            if use_dml {
                #[cfg(target_os = "windows")]
                {
                    builder = builder
                        .with_memory_pattern(false)
                        .map_err(|e| Error::Init(format!("{e}")))?;
                    let ep = DirectMLExecutionProvider::default()
                        .with_device_id(device_id as i32)
                        .build();
                    builder = builder
                        .with_execution_providers([ep])
                        .map_err(|e| Error::Init(format!("{e}")))?;
                }
            }
            builder
                .commit_from_file(model_path)
                .map_err(|e| Error::Init(format!("{e}")))
        };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(build)) {
            Ok(res) => res,
            Err(_) => Err(Error::Init(
                "ONNX Runtime panicked while building session".into(),
            )),
        }
    };

    let wants_dml = matches!(cfg.provider, ProviderChoice::Auto | ProviderChoice::DirectMLOnly);
    #[cfg(target_os = "windows")]
    {
        if wants_dml {
            if let Ok(true) = DirectMLExecutionProvider::default().is_available() {
                if let Ok(session) = try_build(true) {
                    return Ok((session, InferenceProvider::DirectML { device_id }));
                }
            }
        }
    }

    if cfg.provider == ProviderChoice::DirectMLOnly {
        return Err(Error::Init(format!(
            "DirectML requested but unavailable for {}",
            model_path.display()
        )));
    }
    if wants_dml && cfg!(target_os = "windows") {
        log::warn!(
            "DirectML execution provider unavailable; falling back to CPU for {} (device {device_id})",
            model_path.display()
        );
    }

    let session = try_build(false)?;
    Ok((session, InferenceProvider::Cpu))
}

/// Runs `f` and turns an ONNX Runtime panic into an inference error.
pub fn safe_run<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(res) => res,
        Err(_) => Err(Error::Inference("ONNX runtime panic".into())),
    }
}
