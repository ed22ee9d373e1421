// Per-language execution plans
use anyhow::{bail, Context};
use atal_common::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{JudgeError, Result};

/// Recipe for running one language inside a container.
///
/// Templates may contain `{class}`, filled by [`ExecutionPlan::for_source`]
/// with the public class declared in the submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub image: String,
    pub source_filename: String,
    #[serde(default)]
    pub compile_command: Option<String>,
    pub run_command: String,
}

const DEFAULT_CLASS: &str = "Main";

impl ExecutionPlan {
    fn new(image: &str, source_filename: &str, compile_command: Option<&str>, run_command: &str) -> Self {
        Self {
            image: image.to_string(),
            source_filename: source_filename.to_string(),
            compile_command: compile_command.map(str::to_string),
            run_command: run_command.to_string(),
        }
    }

    /// Concrete plan for this submission.
    pub fn for_source(&self, source_code: &str) -> ExecutionPlan {
        let uses_class = self.source_filename.contains("{class}")
            || self.run_command.contains("{class}")
            || self.compile_command.as_deref().is_some_and(|c| c.contains("{class}"));
        if !uses_class {
            return self.clone();
        }

        let class = public_class_name(source_code).unwrap_or(DEFAULT_CLASS);
        let fill = |template: &str| template.replace("{class}", class);
        ExecutionPlan {
            image: self.image.clone(),
            source_filename: fill(&self.source_filename),
            compile_command: self.compile_command.as_deref().map(fill),
            run_command: fill(&self.run_command),
        }
    }

    pub fn needs_compilation(&self) -> bool {
        self.compile_command.is_some()
    }
}

/// First `public class <Name>` declared in `source`, ignoring line comments.
fn public_class_name(source: &str) -> Option<&str> {
    source
        .lines()
        .map(|line| line.split("//").next().unwrap_or(""))
        .find_map(|line| {
            let mut words = line.split_whitespace();
            while let Some(word) = words.next() {
                if word != "public" {
                    continue;
                }
                // Allow modifiers between `public` and `class`.
                let mut rest = words.clone().skip_while(|w| matches!(*w, "final" | "abstract"));
                if rest.next() == Some("class") {
                    let name = rest.next()?;
                    let end = name
                        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
                        .unwrap_or(name.len());
                    let name = &name[..end];
                    if !name.is_empty() {
                        return Some(name);
                    }
                }
            }
            None
        })
}

#[derive(Debug, Deserialize)]
struct LanguagesJson {
    languages: Vec<PlanOverride>,
}

#[derive(Debug, Deserialize)]
struct PlanOverride {
    name: String,
    image: Option<String>,
    source_filename: Option<String>,
    compile_command: Option<String>,
    run_command: Option<String>,
}

/// Static language → plan table.
#[derive(Debug, Clone)]
pub struct PlanTable {
    plans: HashMap<Language, ExecutionPlan>,
}

impl PlanTable {
    pub fn builtin() -> Self {
        let mut plans = HashMap::new();
        plans.insert(
            Language::Python,
            ExecutionPlan::new("python:3.11-slim", "main.py", None, "python3 -u main.py"),
        );
        plans.insert(
            Language::Java,
            ExecutionPlan::new(
                "eclipse-temurin:17-jdk",
                "{class}.java",
                Some("javac -encoding UTF-8 {class}.java"),
                "java -Xss64m -cp . {class}",
            ),
        );
        plans.insert(
            Language::Cpp,
            ExecutionPlan::new(
                "gcc:13",
                "main.cpp",
                Some("g++ -O2 -std=c++17 -o main main.cpp"),
                "./main",
            ),
        );
        Self { plans }
    }

    /// Built-in table with per-language overrides from a languages.json file.
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;
        let languages_json: LanguagesJson =
            serde_json::from_str(&content).context("Failed to parse languages.json")?;

        let mut table = Self::builtin();
        for entry in languages_json.languages {
            let language: Language = entry
                .name
                .parse()
                .with_context(|| format!("Unknown language '{}' in languages.json", entry.name))?;
            let plan = table
                .plans
                .get_mut(&language)
                .with_context(|| format!("No built-in plan to override for {}", language))?;

            if let Some(image) = entry.image {
                plan.image = image;
            }
            if let Some(filename) = entry.source_filename {
                plan.source_filename = filename;
            }
            if entry.compile_command.is_some() {
                plan.compile_command = entry.compile_command;
            }
            if let Some(run) = entry.run_command {
                plan.run_command = run;
            }
        }
        Ok(table)
    }

    pub fn resolve(&self, language: Language) -> Result<&ExecutionPlan> {
        self.plans
            .get(&language)
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }

    /// Resolve by name, for callers holding a raw language string.
    pub fn resolve_name(&self, name: &str) -> Result<&ExecutionPlan> {
        let language: Language = name.parse()?;
        self.resolve(language)
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut langs: Vec<Language> = self.plans.keys().copied().collect();
        langs.sort_by_key(|l| l.as_str());
        langs
    }
}

impl Default for PlanTable {
    fn default() -> Self {
        Self::builtin()
    }
}
