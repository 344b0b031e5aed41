use anyhow::Result;
use tinysched_core::config::Config;
use tinysched_core::registry::AgentRegistry;

/// Check every setting a reconciliation pass depends on. With `fix`, create
/// missing directories and a default (empty) agent control file instead of
/// reporting them.
pub async fn run(fix: bool) -> Result<()> {
    let config = Config::from_env()?;
    let mut problems = config.problems();

    let dirs = [
        ("base", &config.base_dir),
        ("lease", &config.lease_dir),
        ("log", &config.log_dir),
        ("recipes", &config.recipes_dir),
    ];
    for (label, dir) in dirs {
        if dir.is_dir() {
            println!("ok: {label} dir {}", dir.display());
        } else if fix {
            std::fs::create_dir_all(dir)?;
            println!("created: {label} dir {}", dir.display());
        } else {
            problems.push(format!("missing {label} directory: {}", dir.display()));
        }
    }

    if !config.worker_bin.as_os_str().is_empty() && !config.worker_bin.is_file() {
        problems.push(format!(
            "worker executable not found: {}",
            config.worker_bin.display()
        ));
    }

    if !config.agent_control_file.exists() {
        if fix {
            std::fs::write(&config.agent_control_file, "[]\n")?;
            println!(
                "created: agent control file {} (empty registry)",
                config.agent_control_file.display()
            );
        } else {
            println!(
                "note: agent control file {} absent, scheduler will run in legacy mode",
                config.agent_control_file.display()
            );
        }
    }
    match AgentRegistry::load(&config.agent_control_file) {
        Ok(registry) => println!("ok: agent registry ({} agents)", registry.len()),
        Err(e) => problems.push(format!("agent control file: {e}")),
    }

    if config.agent_limits.is_empty() {
        println!("note: no agent limits configured, registry agents default to 1");
    } else {
        for (agent, limit) in &config.agent_limits {
            println!("ok: limit {agent} = {limit}");
        }
    }

    if problems.is_empty() {
        println!("configuration ok");
        Ok(())
    } else {
        for problem in &problems {
            eprintln!("problem: {problem}");
        }
        anyhow::bail!("{} configuration problem(s) found", problems.len());
    }
}
