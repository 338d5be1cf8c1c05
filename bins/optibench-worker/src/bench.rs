// Benchmark suite loading.
//
// One directory per problem under the problems root:
//   problem-1/
//     problem-1.json   (tests, optional comparison tolerance)
//     baseline.py      (baseline program submissions are timed against)
//
// Reference data only: loaded once at startup, shared read-only between
// workers for the lifetime of the process.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
}

/// Per-problem output comparison policy. Exact string equality unless the
/// manifest declares a numeric tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputCheck {
    Exact,
    FloatTolerance(f64),
}

#[derive(Debug, Clone)]
pub struct BenchmarkProblem {
    pub id: String,
    pub baseline_path: PathBuf,
    pub tests: Vec<TestCase>,
    pub check: OutputCheck,
}

#[derive(Debug, Deserialize)]
struct ProblemManifest {
    tests: Vec<TestCase>,
    #[serde(default)]
    float_tolerance: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BenchmarkSuite {
    pub problems: Vec<BenchmarkProblem>,
}

impl BenchmarkSuite {
    /// Load every problem directory under `root`, in sorted (deterministic)
    /// order. Every submission is evaluated against the same sequence.
    pub fn load(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            bail!("problems directory not found: {}", root.display());
        }

        let mut dirs: Vec<PathBuf> = fs::read_dir(root)
            .with_context(|| format!("failed to read problems directory {}", root.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut problems = Vec::with_capacity(dirs.len());
        for dir in dirs {
            problems.push(load_problem(&dir)?);
        }

        if problems.is_empty() {
            bail!("no benchmark problems found under {}", root.display());
        }

        Ok(Self { problems })
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Visible directory entries with the given extension, sorted by name.
/// Dot-prefixed names (editor droppings, macOS AppleDouble files) are
/// ignored.
fn visible_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read problem directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension().map_or(false, |e| e == extension)
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| !n.starts_with('.'))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn load_problem(dir: &Path) -> Result<BenchmarkProblem> {
    let id = dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .with_context(|| format!("unreadable problem directory name: {}", dir.display()))?;

    // Prefer a manifest literally named '<problem>.json'; otherwise take the
    // first JSON in sorted order.
    let json_files = visible_files(dir, "json")?;
    let preferred = format!("{}.json", id);
    let manifest_path = json_files
        .iter()
        .find(|p| p.file_name().map_or(false, |n| n == preferred.as_str()))
        .or_else(|| json_files.first())
        .with_context(|| format!("no manifest JSON found for problem '{}'", id))?;

    let content = fs::read_to_string(manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest: ProblemManifest = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", manifest_path.display()))?;

    if manifest.tests.is_empty() {
        bail!("problem '{}' declares no test cases", id);
    }

    // Prefer a file literally named 'baseline.py'; otherwise the first .py.
    let py_files = visible_files(dir, "py")?;
    let baseline_path = py_files
        .iter()
        .find(|p| p.file_name().map_or(false, |n| n == "baseline.py"))
        .or_else(|| py_files.first())
        .cloned()
        .with_context(|| format!("no baseline program found for problem '{}'", id))?;

    let check = match manifest.float_tolerance {
        Some(eps) => OutputCheck::FloatTolerance(eps),
        None => OutputCheck::Exact,
    };

    Ok(BenchmarkProblem {
        id,
        baseline_path,
        tests: manifest.tests,
        check,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_problem(root: &Path, name: &str, manifest: &str, programs: &[&str]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{}.json", name)), manifest).unwrap();
        for program in programs {
            fs::write(dir.join(program), "print('stub')\n").unwrap();
        }
    }

    const MANIFEST: &str =
        r#"{"tests": [{"input": "1 2\n", "expected_output": "3\n"}]}"#;

    #[test]
    fn test_load_sorted_order() {
        let root = tempfile::tempdir().unwrap();
        write_problem(root.path(), "problem-2", MANIFEST, &["baseline.py"]);
        write_problem(root.path(), "problem-1", MANIFEST, &["baseline.py"]);

        let suite = BenchmarkSuite::load(root.path()).unwrap();
        let ids: Vec<_> = suite.problems.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["problem-1", "problem-2"]);
    }

    #[test]
    fn test_prefers_baseline_py() {
        let root = tempfile::tempdir().unwrap();
        write_problem(
            root.path(),
            "problem-1",
            MANIFEST,
            &["aaa_other.py", "baseline.py"],
        );

        let suite = BenchmarkSuite::load(root.path()).unwrap();
        assert!(suite.problems[0]
            .baseline_path
            .ends_with("problem-1/baseline.py"));
    }

    #[test]
    fn test_falls_back_to_first_py() {
        let root = tempfile::tempdir().unwrap();
        write_problem(
            root.path(),
            "problem-1",
            MANIFEST,
            &["zzz.py", "impl_baseline.py"],
        );

        let suite = BenchmarkSuite::load(root.path()).unwrap();
        assert!(suite.problems[0]
            .baseline_path
            .ends_with("problem-1/impl_baseline.py"));
    }

    #[test]
    fn test_ignores_metadata_files() {
        let root = tempfile::tempdir().unwrap();
        write_problem(root.path(), "problem-1", MANIFEST, &["baseline.py"]);
        let dir = root.path().join("problem-1");
        fs::write(dir.join("._baseline.py"), "junk").unwrap();
        fs::write(dir.join("._problem-1.json"), "junk").unwrap();

        let suite = BenchmarkSuite::load(root.path()).unwrap();
        assert!(suite.problems[0].baseline_path.ends_with("baseline.py"));
        assert_eq!(suite.problems[0].tests.len(), 1);
    }

    #[test]
    fn test_float_tolerance_manifest() {
        let root = tempfile::tempdir().unwrap();
        let manifest = r#"{
            "tests": [{"input": "", "expected_output": "3.14\n"}],
            "float_tolerance": 1e-6
        }"#;
        write_problem(root.path(), "problem-1", manifest, &["baseline.py"]);

        let suite = BenchmarkSuite::load(root.path()).unwrap();
        assert_eq!(
            suite.problems[0].check,
            OutputCheck::FloatTolerance(1e-6)
        );
    }

    #[test]
    fn test_default_check_is_exact() {
        let root = tempfile::tempdir().unwrap();
        write_problem(root.path(), "problem-1", MANIFEST, &["baseline.py"]);

        let suite = BenchmarkSuite::load(root.path()).unwrap();
        assert_eq!(suite.problems[0].check, OutputCheck::Exact);
    }

    #[test]
    fn test_empty_tests_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_problem(root.path(), "problem-1", r#"{"tests": []}"#, &["baseline.py"]);

        let err = BenchmarkSuite::load(root.path()).unwrap_err();
        assert!(err.to_string().contains("no test cases"));
    }

    #[test]
    fn test_missing_baseline_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_problem(root.path(), "problem-1", MANIFEST, &[]);

        let err = BenchmarkSuite::load(root.path()).unwrap_err();
        assert!(err.to_string().contains("no baseline program"));
    }

    #[test]
    fn test_empty_root_rejected() {
        let root = tempfile::tempdir().unwrap();
        assert!(BenchmarkSuite::load(root.path()).is_err());
    }
}
