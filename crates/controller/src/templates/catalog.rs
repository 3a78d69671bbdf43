//! Built-in build templates.

use serde::Serialize;

/// A preset build recipe offered to build configs.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BuildTemplate {
    pub name: &'static str,
    pub language: &'static str,
    pub framework: &'static str,
    pub description: &'static str,
    pub build_image: &'static str,
    pub build_script: &'static str,
}

pub const SYSTEM_TEMPLATES: [BuildTemplate; 3] = [
    BuildTemplate {
        name: "go-build",
        language: "go",
        framework: "",
        description: "Go application build with Kaniko image push",
        build_image: "golang:1.22",
        build_script: "go mod download\nCGO_ENABLED=0 go build -o app ./...",
    },
    BuildTemplate {
        name: "java-maven",
        language: "java",
        framework: "maven",
        description: "Java Maven build with Kaniko image push",
        build_image: "maven:3.9-eclipse-temurin-17",
        build_script: "mvn -B package -DskipTests",
    },
    BuildTemplate {
        name: "nodejs",
        language: "nodejs",
        framework: "",
        description: "Node.js build with npm/yarn/pnpm support and Kaniko image push",
        build_image: "node:20",
        build_script: "if [ -f pnpm-lock.yaml ]; then corepack enable && pnpm install --frozen-lockfile && pnpm build;\nelif [ -f yarn.lock ]; then yarn install --frozen-lockfile && yarn build;\nelse npm ci && npm run build; fi",
    },
];

/// Look up a system template by name.
#[must_use]
pub fn find(name: &str) -> Option<&'static BuildTemplate> {
    SYSTEM_TEMPLATES.iter().find(|t| t.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_presets_by_name() {
        assert_eq!(find("java-maven").map(|t| t.framework), Some("maven"));
        assert!(find("go-build").is_some());
        assert!(find("rust").is_none());
    }
}
