use std::path::Path;

use anyhow::bail;
use medallion_core::PipelineConfig;

pub fn init(path: &str, name: Option<&str>) -> anyhow::Result<()> {
    let project_path = Path::new(path);
    let output = project_path.join("medallion.toml");
    if output.exists() {
        bail!("{} already exists", output.display());
    }

    let dir_name = project_path
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
    let name = name
        .map(str::to_string)
        .or(dir_name)
        .unwrap_or_else(|| "medallion".to_string());

    let config = PipelineConfig::scaffold(&name);
    std::fs::write(&output, config.to_toml_string()?)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
