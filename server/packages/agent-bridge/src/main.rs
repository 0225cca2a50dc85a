fn main() {
    if let Err(err) = agent_bridge::cli::run_agent_bridge() {
        tracing::error!(error = %err, "agent-bridge failed");
        std::process::exit(1);
    }
}
