use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

pub const RC_FILE: &str = ".testlooprc";

pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openrouter/cypher-alpha:free";
pub const DEFAULT_BUILD_COMMAND: &str = "mkdir -p build && cd build && cmake .. && make -j{jobs}";

const DEFAULT_INSTRUMENTATION: &[&str] = &[
    "set(CMAKE_CXX_FLAGS \"${CMAKE_CXX_FLAGS} --coverage\")",
    "set(CMAKE_EXE_LINKER_FLAGS \"${CMAKE_EXE_LINKER_FLAGS} --coverage\")",
];

/// Backend credential. Its `Debug` and `Display` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RefineScope {
    /// Every artifact in the output directory is refined after a failed build.
    #[default]
    All,
    /// Only the artifact of the unit whose build failed.
    Unit,
}

impl RefineScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RefineScope::All => "all",
            RefineScope::Unit => "unit",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "all" => Some(RefineScope::All),
            "unit" => Some(RefineScope::Unit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationConfig {
    pub include_directive: String,
    pub include_marker: String,
    pub instrumentation_marker: String,
    pub instrumentation_lines: Vec<String>,
    pub anchor: String,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            include_directive: "add_subdirectory(test)".to_string(),
            include_marker: "add_subdirectory(test)".to_string(),
            instrumentation_marker: "--coverage".to_string(),
            instrumentation_lines: DEFAULT_INSTRUMENTATION
                .iter()
                .map(ToString::to_string)
                .collect(),
            anchor: "project(".to_string(),
        }
    }
}

/// Raw prompt templates. Placeholders are validated by the prompt composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    pub initial_system: String,
    pub initial_user: String,
    pub refine_system: String,
    pub refine_user: String,
}

impl PromptTemplates {
    pub fn for_target(language: &str, framework: &str) -> Self {
        Self {
            initial_system: format!(
                "You are a strict {language} unit test generator. Output only raw, valid {language} code using the {framework} framework. No markdown, no explanation. Output must compile."
            ),
            initial_user: format!(
                "Generate {framework} unit tests for the following {language} unit.\n\n\
Header:\n<<HEADER>>\n\n\
Source:\n<<SOURCE>>\n\n\
Cover each public function with at least one basic test. Use only {framework}, include the necessary headers, no duplicates. Output only valid, compilable {language} code."
            ),
            refine_system: format!(
                "You are a strict {language} test fixer. Fix only the build errors using valid {framework}-compatible {language} code. No markdown. No extra text. Output only compilable {language} code."
            ),
            refine_user: "Test file:\n<<CODE>>\n\nBuild log:\n<<LOG>>\n\nFix the test file."
                .to_string(),
        }
    }
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self::for_target("C++", "GoogleTest")
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub api_key: Option<ApiKey>,
    pub api_url: String,
    pub model: String,
    pub source_dir: PathBuf,
    pub header_dir: PathBuf,
    pub output_dir: PathBuf,
    pub project_root: PathBuf,
    pub runtime_dir: PathBuf,
    pub build_description: PathBuf,
    pub source_ext: String,
    pub header_ext: String,
    pub test_ext: String,
    pub build_command: String,
    pub build_jobs: usize,
    pub build_timeout_minutes: u64,
    pub error_markers: Vec<String>,
    pub max_refine_attempts: u32,
    pub request_timeout_secs: u64,
    pub refine_scope: RefineScope,
    pub integration: IntegrationConfig,
    pub prompts: PromptTemplates,
}

impl RunConfig {
    pub fn require_api_key(&self) -> Result<&ApiKey> {
        match &self.api_key {
            Some(key) => Ok(key),
            None => bail!(
                "missing API credential: set TESTLOOP_API_KEY (or API) in the environment or .env"
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub model: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub max_refine_attempts: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    pub refine_scope: Option<RefineScope>,
}

#[derive(Debug, Deserialize, Default)]
struct Testlooprc {
    api_url: Option<String>,
    model: Option<String>,
    source_dir: Option<String>,
    header_dir: Option<String>,
    output_dir: Option<String>,
    project_root: Option<String>,
    runtime_dir: Option<String>,
    build_description: Option<String>,
    source_ext: Option<String>,
    header_ext: Option<String>,
    test_ext: Option<String>,
    build_command: Option<String>,
    build_jobs: Option<usize>,
    build_timeout_minutes: Option<u64>,
    error_markers: Option<Vec<String>>,
    max_refine_attempts: Option<u32>,
    request_timeout_secs: Option<u64>,
    refine_scope: Option<RefineScope>,
    #[serde(default)]
    integration: IntegrationSection,
    #[serde(default)]
    prompts: PromptSection,
}

#[derive(Debug, Deserialize, Default)]
struct IntegrationSection {
    include_directive: Option<String>,
    include_marker: Option<String>,
    instrumentation_marker: Option<String>,
    instrumentation_lines: Option<Vec<String>>,
    anchor: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PromptSection {
    language: Option<String>,
    framework: Option<String>,
    initial_system: Option<String>,
    initial_user: Option<String>,
    refine_system: Option<String>,
    refine_user: Option<String>,
    initial_prompt_file: Option<String>,
    refine_prompt_file: Option<String>,
}

/// Builds the immutable run configuration for `cwd`.
///
/// Precedence is CLI overrides, then environment, then `.testlooprc`, then
/// defaults. A `.env` file in `cwd` is loaded first unless `RUN_ENV=production`.
pub fn load_run_config(cwd: &Path, overrides: &CliOverrides) -> Result<RunConfig> {
    load_dotenv(cwd);

    let mut file_cfg = Testlooprc::default();
    let rc_path = cwd.join(RC_FILE);
    if rc_path.exists() {
        let raw = fs::read_to_string(&rc_path)
            .with_context(|| format!("failed to read {}", rc_path.display()))?;
        file_cfg = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", rc_path.display()))?;
    }

    let api_key = env_nonempty("TESTLOOP_API_KEY")
        .or_else(|| env_nonempty("API"))
        .map(ApiKey::new);

    let api_url = first_some(None, env_nonempty("TESTLOOP_API_URL"), file_cfg.api_url)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    let model = first_some(
        overrides.model.clone(),
        env_nonempty("TESTLOOP_MODEL"),
        file_cfg.model,
    )
    .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let source_dir = first_some(
        overrides.source_dir.clone(),
        env_path("TESTLOOP_SOURCE_DIR"),
        file_cfg.source_dir.map(PathBuf::from),
    )
    .unwrap_or_else(|| PathBuf::from("controllers"));

    let header_dir = first_some(
        None,
        env_path("TESTLOOP_HEADER_DIR"),
        file_cfg.header_dir.map(PathBuf::from),
    )
    .unwrap_or_else(|| source_dir.clone());

    let output_dir = first_some(
        overrides.output_dir.clone(),
        env_path("TESTLOOP_OUTPUT_DIR"),
        file_cfg.output_dir.map(PathBuf::from),
    )
    .unwrap_or_else(|| PathBuf::from("test"));

    let project_root = first_some(
        None,
        env_path("TESTLOOP_PROJECT_ROOT"),
        file_cfg.project_root.map(PathBuf::from),
    )
    .unwrap_or_else(|| PathBuf::from("."));

    let runtime_dir = first_some(
        None,
        env_path("TESTLOOP_RUNTIME_DIR"),
        file_cfg.runtime_dir.map(PathBuf::from),
    )
    .unwrap_or_else(|| PathBuf::from(".testloop"));

    let project_root = resolve(cwd, project_root);
    let build_description = project_root.join(
        file_cfg
            .build_description
            .unwrap_or_else(|| "CMakeLists.txt".to_string()),
    );

    let build_command = first_some(
        None,
        env_nonempty("TESTLOOP_BUILD_COMMAND"),
        file_cfg.build_command,
    )
    .unwrap_or_else(|| DEFAULT_BUILD_COMMAND.to_string());

    let build_jobs = first_some(None, env_parse("TESTLOOP_BUILD_JOBS"), file_cfg.build_jobs)
        .unwrap_or_else(default_jobs);

    let build_timeout_minutes = first_some(
        None,
        env_parse("TESTLOOP_BUILD_TIMEOUT_MINUTES"),
        file_cfg.build_timeout_minutes,
    )
    .unwrap_or(30);

    let error_markers = first_some(
        None,
        env_csv("TESTLOOP_ERROR_MARKERS"),
        file_cfg.error_markers,
    )
    .unwrap_or_else(|| vec!["error:".to_string()]);

    let max_refine_attempts = first_some(
        overrides.max_refine_attempts,
        env_parse("TESTLOOP_MAX_REFINE_ATTEMPTS"),
        file_cfg.max_refine_attempts,
    )
    .unwrap_or(3);

    let request_timeout_secs = first_some(
        overrides.request_timeout_secs,
        env_parse("TESTLOOP_REQUEST_TIMEOUT_SECS"),
        file_cfg.request_timeout_secs,
    )
    .unwrap_or(120);

    let refine_scope = first_some(
        overrides.refine_scope,
        env::var("TESTLOOP_REFINE_SCOPE")
            .ok()
            .and_then(|v| RefineScope::parse(&v)),
        file_cfg.refine_scope,
    )
    .unwrap_or_default();

    let integration = merge_integration(file_cfg.integration);
    let prompts = merge_prompts(cwd, file_cfg.prompts)?;

    if build_jobs == 0 {
        bail!("build_jobs must be greater than 0");
    }
    if error_markers.iter().all(|m| m.is_empty()) {
        bail!("error_markers must contain at least one non-empty marker");
    }

    Ok(RunConfig {
        api_key,
        api_url,
        model,
        source_dir: resolve(cwd, source_dir),
        header_dir: resolve(cwd, header_dir),
        output_dir: resolve(cwd, output_dir),
        project_root,
        runtime_dir: resolve(cwd, runtime_dir),
        build_description,
        source_ext: file_cfg.source_ext.unwrap_or_else(|| "cc".to_string()),
        header_ext: file_cfg.header_ext.unwrap_or_else(|| "h".to_string()),
        test_ext: file_cfg.test_ext.unwrap_or_else(|| "cc".to_string()),
        build_command,
        build_jobs,
        build_timeout_minutes,
        error_markers,
        max_refine_attempts,
        request_timeout_secs,
        refine_scope,
        integration,
        prompts,
    })
}

fn load_dotenv(cwd: &Path) {
    if env::var("RUN_ENV").ok().as_deref() == Some("production") {
        return;
    }
    // Absent .env is the normal case outside development.
    let _ = dotenvy::from_path(cwd.join(".env"));
}

fn merge_integration(section: IntegrationSection) -> IntegrationConfig {
    let defaults = IntegrationConfig::default();
    let include_directive = section
        .include_directive
        .unwrap_or(defaults.include_directive);
    IntegrationConfig {
        include_marker: section
            .include_marker
            .unwrap_or_else(|| include_directive.clone()),
        include_directive,
        instrumentation_marker: section
            .instrumentation_marker
            .unwrap_or(defaults.instrumentation_marker),
        instrumentation_lines: section
            .instrumentation_lines
            .unwrap_or(defaults.instrumentation_lines),
        anchor: section.anchor.unwrap_or(defaults.anchor),
    }
}

fn merge_prompts(cwd: &Path, section: PromptSection) -> Result<PromptTemplates> {
    let language = section.language.unwrap_or_else(|| "C++".to_string());
    let framework = section.framework.unwrap_or_else(|| "GoogleTest".to_string());
    let defaults = PromptTemplates::for_target(&language, &framework);

    let initial_user = match section.initial_prompt_file {
        Some(file) => read_template(cwd, &file)?,
        None => section.initial_user.unwrap_or(defaults.initial_user),
    };
    let refine_user = match section.refine_prompt_file {
        Some(file) => read_template(cwd, &file)?,
        None => section.refine_user.unwrap_or(defaults.refine_user),
    };

    Ok(PromptTemplates {
        initial_system: section.initial_system.unwrap_or(defaults.initial_system),
        initial_user,
        refine_system: section.refine_system.unwrap_or(defaults.refine_system),
        refine_user,
    })
}

fn read_template(cwd: &Path, file: &str) -> Result<String> {
    let path = resolve(cwd, PathBuf::from(file));
    fs::read_to_string(&path)
        .with_context(|| format!("failed to read prompt template {}", path.display()))
}

fn resolve(cwd: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

fn default_jobs() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn first_some<T>(a: Option<T>, b: Option<T>, c: Option<T>) -> Option<T> {
    a.or(b).or(c)
}

fn env_nonempty(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_nonempty(key).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.trim().parse().ok()
}

fn env_csv(key: &str) -> Option<Vec<String>> {
    let value = env::var(key).ok()?;
    let parts = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_is_redacted() {
        let key = ApiKey::new("sk-secret");
        assert_eq!(format!("{key:?}"), "ApiKey(***)");
        assert_eq!(key.to_string(), "***");
        assert_eq!(key.expose(), "sk-secret");
    }

    #[test]
    fn refine_scope_parses_case_insensitively() {
        assert_eq!(RefineScope::parse("ALL"), Some(RefineScope::All));
        assert_eq!(RefineScope::parse("unit"), Some(RefineScope::Unit));
        assert_eq!(RefineScope::parse("some"), None);
    }

    #[test]
    fn default_templates_carry_placeholders() {
        let t = PromptTemplates::default();
        assert!(t.initial_user.contains("<<SOURCE>>"));
        assert!(t.initial_user.contains("<<HEADER>>"));
        assert!(t.refine_user.contains("<<CODE>>"));
        assert!(t.refine_user.contains("<<LOG>>"));
        assert!(t.initial_system.contains("GoogleTest"));
    }

    #[test]
    fn target_words_flow_into_templates() {
        let t = PromptTemplates::for_target("C", "Unity");
        assert!(t.initial_system.contains("strict C unit test generator"));
        assert!(t.refine_system.contains("Unity-compatible"));
    }

    #[test]
    fn include_marker_follows_custom_directive() {
        let merged = merge_integration(IntegrationSection {
            include_directive: Some("add_subdirectory(generated)".to_string()),
            ..IntegrationSection::default()
        });
        assert_eq!(merged.include_marker, "add_subdirectory(generated)");
        assert_eq!(merged.anchor, "project(");
    }
}
