//! Automation server script rendering.

use crate::error::{ExecutorError, Result};
use crate::server::LaunchSpec;

const TEMPLATE: &str = include_str!("../assets/automation_server.js");

/// Render the automation server script for one launch.
///
/// Every `{{KEY}}` placeholder is replaced; a leftover placeholder is an error.
pub fn render_server_script(spec: &LaunchSpec) -> Result<String> {
    let optimization = &spec.optimization;
    let browser_args = serde_json::to_string(&optimization.browser_args)
        .map_err(|e| ExecutorError::Script(e.to_string()))?;
    let host = serde_json::to_string(&spec.endpoint.host)
        .map_err(|e| ExecutorError::Script(e.to_string()))?;

    let params: [(&str, String); 9] = [
        // already quoted by serde_json
        ("'{{HOST}}'", host),
        ("{{PORT}}", spec.endpoint.port.to_string()),
        ("{{HEADLESS}}", spec.headless.to_string()),
        ("{{BROWSER_ARGS}}", browser_args),
        ("{{VIEWPORT_WIDTH}}", optimization.viewport.width.to_string()),
        ("{{VIEWPORT_HEIGHT}}", optimization.viewport.height.to_string()),
        ("{{SCREENSHOT_QUALITY}}", optimization.screenshot_quality.to_string()),
        ("{{CAPTURE_SCREENSHOTS}}", optimization.capture_screenshots().to_string()),
        ("{{ACTION_TIMEOUT_MS}}", (optimization.timeout * 1000).to_string()),
    ];

    let mut script = TEMPLATE.to_string();
    for (placeholder, value) in &params {
        script = script.replace(placeholder, value);
    }

    if let Some(start) = script.find("{{") {
        let end = script[start..].find("}}").map_or(script.len(), |i| start + i + 2);
        return Err(ExecutorError::Script(format!(
            "unreplaced placeholder {}",
            &script[start..end]
        )));
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Endpoint;
    use probekit_core::{AiSettings, OptimizationConfig, PressureTier};

    fn spec(tier: PressureTier) -> LaunchSpec {
        LaunchSpec {
            endpoint: Endpoint::new("127.0.0.1", 3007),
            headless: true,
            memory_cap_mb: 400,
            optimization: OptimizationConfig::for_tier(tier),
            ai: AiSettings::default(),
        }
    }

    #[test]
    fn test_render_fills_every_placeholder() {
        let script = render_server_script(&spec(PressureTier::Low)).unwrap();
        assert!(!script.contains("{{"));
        assert!(script.contains("const HOST = \"127.0.0.1\";"));
        assert!(script.contains("const PORT = 3007;"));
        assert!(script.contains("const HEADLESS = true;"));
        assert!(script.contains("width: 1280, height: 720"));
        assert!(script.contains(r#"["--no-sandbox","--disable-dev-shm-usage","--disable-gpu"]"#));
        assert!(script.contains("const CAPTURE_SCREENSHOTS = true;"));
    }

    #[test]
    fn test_render_high_pressure() {
        let script = render_server_script(&spec(PressureTier::High)).unwrap();
        assert!(script.contains("--disable-images"));
        assert!(script.contains("const CAPTURE_SCREENSHOTS = false;"));
        assert!(script.contains("const ACTION_TIMEOUT_MS = 15000;"));
    }
}
