//! Shell text written to a client's stdin for each command.

use protocol::agent::{command_line, BootstrapArgs, QueryArgs};
use protocol::{COMMAND_DONE_PREFIX, EXIT_CODE_PREFIX, RESET_OUTPUT};

use crate::model::{LogStream, SudoMode};

const HEREDOC_DELIMITER: &str = "LOGFLEET_AGENT_EOF";

/// Remote path of the agent; the md5 keeps different script versions apart.
pub(crate) fn agent_path(agent_dir: &str, agent_script: &str) -> String {
    let digest = md5::compute(agent_script.as_bytes());
    format!("{}/logfleet_agent_{:x}.sh", agent_dir.trim_end_matches('/'), digest)
}

fn agent_program(stream: &LogStream, agent_path: &str) -> Vec<String> {
    let mut program = Vec::new();
    if stream.shell.sudo == SudoMode::FullCommand {
        program.push("sudo".to_string());
        program.push("-n".to_string());
    }
    program.push("bash".to_string());
    program.push(agent_path.to_string());
    program
}

fn invocation(stream: &LogStream, agent_path: &str, args: &[String]) -> String {
    let program = agent_program(stream, agent_path);
    let program: Vec<&str> = program.iter().map(String::as_str).collect();
    command_line(&program, args)
}

/// Wraps a command body in reset markers, the exit code and the done sentinels.
pub(crate) fn render_command(idx: u64, body: &str) -> String {
    let mut script = String::new();
    script.push_str(&format!("echo {RESET_OUTPUT}; echo {RESET_OUTPUT} >&2\n"));
    script.push_str(body);
    if !body.ends_with('\n') {
        script.push('\n');
    }
    script.push_str(&format!("echo \"{EXIT_CODE_PREFIX}$?\"\n"));
    script.push_str(&format!(
        "echo {COMMAND_DONE_PREFIX}{idx}; echo {COMMAND_DONE_PREFIX}{idx} >&2\n"
    ));
    script
}

pub(crate) fn bootstrap_body(stream: &LogStream, agent_dir: &str, agent_script: &str) -> String {
    let path = agent_path(agent_dir, agent_script);
    let mut body = String::new();
    for init in &stream.shell.init_commands {
        body.push_str(init);
        body.push('\n');
    }
    let dir = shell_words::quote(agent_dir);
    let quoted_path = shell_words::quote(&path);
    body.push_str(&format!(
        "mkdir -p {dir} && cat > {quoted_path} <<'{HEREDOC_DELIMITER}'\n"
    ));
    body.push_str(agent_script);
    if !agent_script.ends_with('\n') {
        body.push('\n');
    }
    body.push_str(HEREDOC_DELIMITER);
    body.push('\n');
    let args = BootstrapArgs {
        logfile_last: stream.logfile_last.clone(),
        logfile_prev: stream.logfile_prev.clone(),
    };
    body.push_str(&format!(
        "{} && echo '{}' || echo '{}'\n",
        invocation(stream, &path, &args.to_args()),
        protocol::BOOTSTRAP_OK,
        protocol::BOOTSTRAP_FAILED,
    ));
    body
}

pub(crate) fn query_body(stream: &LogStream, agent_path: &str, args: &QueryArgs) -> String {
    format!("{}\n", invocation(stream, agent_path, &args.to_args()))
}

pub(crate) const PING_BODY: &str = "true\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShellOptions;

    fn stream(sudo: SudoMode) -> LogStream {
        LogStream {
            name: "web1".to_string(),
            host: "web1".to_string(),
            port: None,
            user: None,
            jumphost: None,
            logfile_last: "/var/log/syslog".to_string(),
            logfile_prev: "/var/log/syslog.1".to_string(),
            shell: ShellOptions {
                sudo,
                init_commands: vec!["export LC_ALL=C".to_string()],
            },
        }
    }

    #[test]
    fn command_is_framed_by_markers_on_both_streams() {
        let script = render_command(7, "true");
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            lines,
            vec![
                "echo reset_output; echo reset_output >&2",
                "true",
                "echo \"exit_code:$?\"",
                "echo command_done:7; echo command_done:7 >&2",
            ]
        );
    }

    #[test]
    fn agent_path_depends_on_script_content() {
        let first = agent_path("/tmp/", "echo one");
        let second = agent_path("/tmp", "echo two");
        assert!(first.starts_with("/tmp/logfleet_agent_"));
        assert!(first.ends_with(".sh"));
        assert_ne!(first, second);
        assert_eq!(first, agent_path("/tmp", "echo one"));
    }

    #[test]
    fn bootstrap_writes_agent_then_runs_it_with_sudo() {
        let body = bootstrap_body(&stream(SudoMode::FullCommand), "/tmp", "#!/bin/bash\necho hi");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], "export LC_ALL=C");
        assert!(lines[1].starts_with("mkdir -p /tmp && cat > /tmp/logfleet_agent_"));
        assert_eq!(lines[2], "#!/bin/bash");
        assert_eq!(lines[4], HEREDOC_DELIMITER);
        assert!(lines[5].starts_with("sudo -n bash /tmp/logfleet_agent_"));
        assert!(lines[5].ends_with(
            "logstream_info --logfile-last /var/log/syslog --logfile-prev /var/log/syslog.1 && echo 'bootstrap ok' || echo 'bootstrap failed'"
        ));
    }

    #[test]
    fn plain_bootstrap_has_no_sudo() {
        let body = bootstrap_body(&stream(SudoMode::Disabled), "/tmp", "echo hi\n");
        assert!(body.lines().any(|line| line.starts_with("bash /tmp/logfleet_agent_")));
        assert!(!body.contains("sudo"));
    }
}
