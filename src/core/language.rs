use std::path::Path;

use crate::config::Toolchains;
use crate::core::domain::{CommandSpec, Language, RunPlan, SourceFile};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const EXECUTABLE: &str = "./main";

/// Turns a language and source text into a [`RunPlan`].
///
/// Only plans: nothing is written or executed here. The toolchain paths are
/// fixed when the adapter is built, so a plan never changes while a
/// submission is in flight.
#[derive(Debug, Clone)]
pub struct LanguageAdapter {
    toolchains: Toolchains,
}

impl LanguageAdapter {
    pub fn new(toolchains: Toolchains) -> Self {
        Self { toolchains }
    }

    pub fn plan(&self, language: Language, source: &str, workdir: &Path) -> RunPlan {
        let mut env = vec![
            ("PATH".to_string(), SANDBOX_PATH.to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];

        // Compilers leave `./main` behind; interpreters run the source itself.
        let (file_name, tool, args): (&str, &Path, &[&str]) = match language {
            Language::GnuCpp => (
                "main.cpp",
                self.toolchains.gnucpp.as_path(),
                &["-std=c++17", "-O2", "-o", "main", "main.cpp"],
            ),
            Language::GnuC => (
                "main.c",
                self.toolchains.gcc.as_path(),
                &["-std=c11", "-O2", "-o", "main", "main.c", "-lm"],
            ),
            Language::Rust => (
                "main.rs",
                self.toolchains.rustc.as_path(),
                &["--edition", "2021", "-O", "-o", "main", "main.rs"],
            ),
            Language::Python => {
                env.push(("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()));
                env.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
                ("main.py", self.toolchains.python.as_path(), &["main.py"])
            }
            Language::Shell => ("main.sh", self.toolchains.shell.as_path(), &["main.sh"]),
        };
        let tool = CommandSpec::new(tool, args.iter().copied());
        let (build, run) = if language.is_compiled() {
            (Some(tool), CommandSpec::new(EXECUTABLE, Vec::<String>::new()))
        } else {
            (None, tool)
        };

        RunPlan {
            language,
            source: SourceFile {
                name: file_name.to_string(),
                contents: source.to_string(),
            },
            build,
            run,
            workdir: workdir.to_path_buf(),
            env,
        }
    }
}
