//! Opening messages for a run.

use sandcastle_core::{Message, Task};

const SYSTEM_PROMPT: &str = "\
You are a software engineering agent working inside a sandboxed project checkout.

You can only act through the provided tools:
- list_files, read_file, search to inspect the project
- write_file, apply_patch to change files
- run_command to run allowlisted commands (no pipes, redirection, or chaining)
- task_complete, task_blocked, task_failed to finish

Every file access and command is checked against a policy. When a call is
rejected, read the reason and choose a different approach instead of retrying
the same call.

Finish by calling exactly one of the task_* tools. task_complete must include
one acceptance result per criterion, each with passed=true and concrete
evidence such as command output or file contents. If you cannot meet a
criterion, call task_failed or task_blocked instead.";

pub fn system_message() -> Message {
    Message::system(SYSTEM_PROMPT)
}

/// The task brief the agent starts from.
pub fn task_message(task: &Task) -> Message {
    let mut brief = format!("# Task {}: {}\n", task.id, task.title);
    if !task.description.trim().is_empty() {
        brief.push('\n');
        brief.push_str(task.description.trim());
        brief.push('\n');
    }
    brief.push_str("\n## Acceptance criteria\n");
    for (i, criterion) in task.acceptance_criteria.iter().enumerate() {
        brief.push_str(&format!("{}. {}\n", i + 1, criterion));
    }
    Message::user(brief)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandcastle_core::Role;

    #[test]
    fn task_message_lists_criteria() {
        let task = Task::new("T-7", "Fix login")
            .with_description("Users cannot log in with uppercase emails.")
            .with_criteria(["Emails are compared case-insensitively", "npm test passes"]);
        let msg = task_message(&task);
        assert_eq!(msg.role, Role::User);
        assert!(msg.content.starts_with("# Task T-7: Fix login"));
        assert!(msg.content.contains("1. Emails are compared case-insensitively"));
        assert!(msg.content.contains("2. npm test passes"));
    }

    #[test]
    fn system_prompt_names_terminal_tools() {
        let msg = system_message();
        assert_eq!(msg.role, Role::System);
        for tool in ["task_complete", "task_blocked", "task_failed"] {
            assert!(msg.content.contains(tool));
        }
    }
}
