use std::path::Path;

use flow_core::FlowConfig;

pub fn init(name: &str, output: Option<&Path>) -> anyhow::Result<()> {
    let config = FlowConfig::scaffold(name);
    config.validate()?;
    let toml = config.to_toml_string()?;

    match output {
        Some(path) => {
            std::fs::write(path, toml)?;
            println!("✓ Generated {}", path.display());
        }
        None => print!("{toml}"),
    }
    Ok(())
}
