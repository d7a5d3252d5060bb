//! Lifecycle scripts shipped inside the installer.

use crate::CoreError;

/// What the assembler hands to a renderer.
#[derive(Debug, Clone, Copy)]
pub struct ScriptInput<'a> {
    pub namespaces: &'a [String],
    /// Environment variables the operator must set before installing.
    pub required_env: &'a [String],
    /// Hex sha256 of the merged compose file.
    pub manifest_checksum: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scripts {
    pub install: String,
    pub verify: String,
}

/// Produces `bin/install.sh` and `bin/verify.sh`.
pub trait ScriptRenderer: Send + Sync {
    fn render(&self, input: &ScriptInput<'_>) -> Result<Scripts, CoreError>;
}

/// POSIX shell scripts driving `docker load` and `docker compose`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateScripts;

const INSTALL_TEMPLATE: &str = r#"#!/bin/sh
# Offline installer generated by ferry.
set -eu
cd "$(dirname "$0")/.."

NAMESPACES="@NAMESPACES@"
REQUIRED_ENV="@REQUIRED_ENV@"

sh bin/verify.sh

if [ ! -f .env ]; then
    cp env/.env.example .env
fi

missing=""
for name in $REQUIRED_ENV; do
    if ! grep -q "^${name}=." .env; then
        missing="$missing $name"
    fi
done
if [ -n "$missing" ]; then
    echo "set these variables in $(pwd)/.env, then run this script again:$missing" >&2
    exit 1
fi

for image in images/*.tar; do
    [ -e "$image" ] || continue
    docker load -i "$image"
done

docker compose --env-file .env -f @COMPOSE_FILE@ up -d
echo "installed: $NAMESPACES"
"#;

const VERIFY_TEMPLATE: &str = r#"#!/bin/sh
# Verify installer contents against manifest.json.
set -eu
cd "$(dirname "$0")/.."

echo "@CHECKSUM@  @COMPOSE_FILE@" | sha256sum -c -
sed -n 's/^ *"\([^"]*\/[^"]*\)": "sha256:\([0-9a-f]\{64\}\)",\{0,1\}$/\2  \1/p' manifest.json | sha256sum -c --quiet -
echo "installer verified"
"#;

fn is_shell_word(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

impl ScriptRenderer for TemplateScripts {
    fn render(&self, input: &ScriptInput<'_>) -> Result<Scripts, CoreError> {
        if input.manifest_checksum.len() != 64
            || !input.manifest_checksum.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(CoreError::Config(format!(
                "manifest checksum must be 64 hex characters, got '{}'",
                input.manifest_checksum
            )));
        }
        for word in input.namespaces.iter().chain(input.required_env) {
            if !is_shell_word(word) {
                return Err(CoreError::Config(format!(
                    "'{word}' cannot be embedded in an installer script"
                )));
            }
        }

        let install = INSTALL_TEMPLATE
            .replace("@NAMESPACES@", &input.namespaces.join(" "))
            .replace("@REQUIRED_ENV@", &input.required_env.join(" "))
            .replace("@COMPOSE_FILE@", crate::assembler::COMPOSE_FILE);
        let verify = VERIFY_TEMPLATE
            .replace("@CHECKSUM@", input.manifest_checksum)
            .replace("@COMPOSE_FILE@", crate::assembler::COMPOSE_FILE);
        Ok(Scripts { install, verify })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKSUM: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn renders_inputs_into_scripts() {
        let namespaces = vec!["web".to_owned(), "db".to_owned()];
        let env = vec!["DB_PASSWORD".to_owned()];
        let scripts = TemplateScripts
            .render(&ScriptInput {
                namespaces: &namespaces,
                required_env: &env,
                manifest_checksum: CHECKSUM,
            })
            .unwrap();
        assert!(scripts.install.starts_with("#!/bin/sh"));
        assert!(scripts.install.contains(r#"NAMESPACES="web db""#));
        assert!(scripts.install.contains(r#"REQUIRED_ENV="DB_PASSWORD""#));
        assert!(scripts.install.contains("compose/docker-compose.yml up -d"));
        assert!(scripts.verify.contains(&format!("{CHECKSUM}  compose/docker-compose.yml")));
        assert!(!scripts.install.contains('@'));
    }

    #[test]
    fn rejects_unsafe_words() {
        let bad = vec!["web; rm -rf /".to_owned()];
        let result = TemplateScripts.render(&ScriptInput {
            namespaces: &bad,
            required_env: &[],
            manifest_checksum: CHECKSUM,
        });
        assert!(result.is_err());
    }

    #[test]
    fn rejects_malformed_checksum() {
        let result = TemplateScripts.render(&ScriptInput {
            namespaces: &[],
            required_env: &[],
            manifest_checksum: "sha256:abc",
        });
        assert!(result.is_err());
    }
}
