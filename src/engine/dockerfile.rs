//! Dockerfile rendering for CLI engines
//!
//! A [`BuildRequest`] becomes a Dockerfile plus the context files it
//! references (archives, patches, plain files).

use super::runtime::{BuildRequest, Instruction};
use serde_json::json;

/// Directory inside the image where context files are staged
const STAGING_DIR: &str = "/.conveyor";

/// A rendered build context
#[derive(Debug, Default)]
pub struct BuildContextFiles {
    pub dockerfile: String,
    /// Context-relative file names and contents
    pub files: Vec<(String, Vec<u8>)>,
}

/// Render `request` into a Dockerfile and its context files
pub fn render(request: &BuildRequest) -> BuildContextFiles {
    let mut out = BuildContextFiles::default();
    let mut lines = vec![format!("FROM {}", request.base)];

    let mut label_keys: Vec<&String> = request.labels.keys().collect();
    label_keys.sort();
    for key in label_keys {
        lines.push(format!(
            "LABEL {}={}",
            key,
            dockerfile_quote_always(&request.labels[key])
        ));
    }

    for (n, instruction) in request.instructions.iter().enumerate() {
        match instruction {
            Instruction::Run(commands) => {
                if commands.is_empty() {
                    continue;
                }
                let script = shell_script(&request.run_env, commands);
                lines.push(format!("RUN {}", exec_form(&["/bin/sh", "-c", &script])));
            }
            Instruction::Env(key, value) => {
                lines.push(format!("ENV {}={}", key, dockerfile_quote(value)));
            }
            Instruction::Expose(port) => lines.push(format!("EXPOSE {}", port)),
            Instruction::Volume(path) => lines.push(format!("VOLUME {}", exec_form(&[path]))),
            Instruction::Workdir(path) => lines.push(format!("WORKDIR {}", path)),
            Instruction::User(user) => lines.push(format!("USER {}", user)),
            Instruction::Cmd(args) => lines.push(format!("CMD {}", exec_form(args))),
            Instruction::Entrypoint(args) => {
                lines.push(format!("ENTRYPOINT {}", exec_form(args)))
            }
            Instruction::AddArchive { archive, to } => {
                let name = format!("archive-{}.tar", n);
                // ADD extracts local tar archives
                lines.push(format!("ADD {} {}", name, to));
                out.files.push((name, archive.clone()));
            }
            Instruction::ApplyPatch { patch, to } => {
                let name = format!("patch-{}.diff", n);
                let staged = format!("{}/{}", STAGING_DIR, name);
                lines.push(format!("COPY {} {}", name, staged));
                let script = format!(
                    "set -e; mkdir -p {to}; cd {to}; \
                     if command -v git >/dev/null 2>&1; then git apply --whitespace=nowarn {staged}; \
                     else patch -p1 < {staged}; fi; rm -f {staged}",
                    to = shell_quote(to),
                    staged = staged
                );
                lines.push(format!("RUN {}", exec_form(&["/bin/sh", "-c", &script])));
                out.files.push((name, patch.clone()));
            }
            Instruction::AddFile { content, to } => {
                let name = format!("file-{}", n);
                lines.push(format!("COPY {} {}", name, to));
                out.files.push((name, content.clone()));
            }
        }
    }

    lines.push(String::new());
    out.dockerfile = lines.join("\n");
    out
}

fn shell_script(env: &std::collections::HashMap<String, String>, commands: &[String]) -> String {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    let mut script: Vec<String> = vec!["set -e".to_string()];
    for key in keys {
        script.push(format!("export {}={}", key, shell_quote(&env[key])));
    }
    script.extend(commands.iter().cloned());
    script.join("\n")
}

fn exec_form<S: AsRef<str>>(args: &[S]) -> String {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    json!(args).to_string()
}

/// Single-quote a value for `/bin/sh`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Quote a value for Dockerfile ENV instruction.
/// Values containing $ (variable references) must be quoted properly.
/// Embedded double quotes and backslashes are escaped to prevent injection.
fn dockerfile_quote(value: &str) -> String {
    if value.contains('$') || value.contains(' ') || value.contains('"') || value.contains('\\') {
        dockerfile_quote_always(value)
    } else {
        value.to_string()
    }
}

fn dockerfile_quote_always(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request(instructions: Vec<Instruction>) -> BuildRequest {
        let mut request = BuildRequest::new("alpine:3.20", "conveyor-build-1");
        request.instructions = instructions;
        request
    }

    #[test]
    fn render_structure() {
        let mut req = request(vec![
            Instruction::Run(vec!["apk add curl".to_string()]),
            Instruction::Workdir("/app".to_string()),
            Instruction::Cmd(vec!["./run".to_string()]),
        ]);
        req.labels
            .insert("io.conveyor.stage".to_string(), "install".to_string());

        let out = render(&req);
        let lines: Vec<&str> = out.dockerfile.lines().collect();
        assert_eq!(lines[0], "FROM alpine:3.20");
        assert_eq!(lines[1], "LABEL io.conveyor.stage=\"install\"");
        assert_eq!(
            lines[2],
            r#"RUN ["/bin/sh","-c","set -e\napk add curl"]"#
        );
        assert_eq!(lines[3], "WORKDIR /app");
        assert_eq!(lines[4], r#"CMD ["./run"]"#);
        assert!(out.files.is_empty());
    }

    #[test]
    fn render_stages_context_files() {
        let out = render(&request(vec![
            Instruction::AddArchive {
                archive: b"tar".to_vec(),
                to: "/app".to_string(),
            },
            Instruction::ApplyPatch {
                patch: b"diff".to_vec(),
                to: "/app".to_string(),
            },
        ]));
        assert!(out.dockerfile.contains("ADD archive-0.tar /app"));
        assert!(out.dockerfile.contains("COPY patch-1.diff /.conveyor/patch-1.diff"));
        assert!(out.dockerfile.contains("git apply"));
        let names: Vec<&str> = out.files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["archive-0.tar", "patch-1.diff"]);
    }

    #[test]
    fn run_env_is_exported_before_commands() {
        let mut req = request(vec![Instruction::Run(vec!["ssh -T git@host".to_string()])]);
        req.run_env = HashMap::from([(
            "SSH_AUTH_SOCK".to_string(),
            "/run/ssh.sock".to_string(),
        )]);
        let out = render(&req);
        assert!(out
            .dockerfile
            .contains(r#"export SSH_AUTH_SOCK='/run/ssh.sock'\nssh -T git@host"#));
    }

    #[test]
    fn empty_run_is_skipped() {
        let out = render(&request(vec![Instruction::Run(vec![])]));
        assert!(!out.dockerfile.contains("RUN"));
    }

    #[test]
    fn dockerfile_quote_simple() {
        assert_eq!(dockerfile_quote("/usr/bin"), "/usr/bin");
    }

    #[test]
    fn dockerfile_quote_with_variable() {
        assert_eq!(dockerfile_quote("$HOME/bin"), "\"$HOME/bin\"");
    }

    #[test]
    fn dockerfile_quote_escapes_embedded_quotes() {
        assert_eq!(dockerfile_quote("say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
