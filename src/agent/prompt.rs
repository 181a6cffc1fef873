//! Prompt and comment text.

use std::fmt::Write;

use crate::platform::Comment;
use crate::task::{HANDBACK_MARKER, Task};
use crate::tools::Limitation;

/// Sent when the model stops with staged changes that have not passed
/// validation.
pub const VALIDATE_REMINDER: &str = "You have staged changes that have not passed validation. \
    Call trigger_validation to run the pipeline before finishing, or report_limitation if \
    you cannot make it pass.";

/// Sent when a finished conversation is resumed without new human input.
pub const CONTINUE_MESSAGE: &str = "The task was handed back to you without new comments. \
    Review the current state of the change and continue.";

pub fn system_prompt(task: &Task, validation: bool) -> String {
    let mut prompt = format!(
        "You are an autonomous software engineer working on the repository {}.\n\
         You resolve one issue at a time by editing files through the tools you are given.\n\n\
         Rules:\n\
         - Explore the repository with list_dir and read_file before changing anything.\n\
         - Make the smallest change that resolves the issue. Edits are staged and land as a \
           single commit on the branch `{}` once you finish.\n\
         - When you are done, reply with a short summary of the change and no tool calls.\n\
         - If the task needs something you cannot do with these tools, call report_limitation \
           instead of guessing.\n",
        task.key.repo, task.branch
    );
    if validation {
        prompt.push_str(
            "- Before finishing, run trigger_validation. If it fails, read the diagnostic, fix \
             the problem and run it again.\n",
        );
    }
    prompt
}

/// The opening user turn describing the task.
pub fn initial_message(task: &Task, bot_login: &str) -> String {
    let mut out = String::new();
    let issue = &task.issue;
    let _ = writeln!(out, "# {} #{}: {}\n", task.key.repo, issue.number, issue.title);
    if issue.body.trim().is_empty() {
        out.push_str("(no description)\n");
    } else {
        let _ = writeln!(out, "{}", issue.body.trim());
    }

    if !task.comments.is_empty() {
        out.push_str("\n## Comments\n");
        for comment in &task.comments {
            write_comment(&mut out, comment, bot_login);
        }
    }

    if let Some(context) = &task.pull {
        let pull = &context.pull;
        let _ = writeln!(
            out,
            "\n## Pull request #{}: {}\nBranch `{}` into `{}`.",
            pull.number, pull.title, pull.head_branch, pull.base_branch
        );
        if !context.files.is_empty() {
            out.push_str("\nChanged files:\n");
            for file in &context.files {
                let _ = writeln!(
                    out,
                    "- {} ({}, +{} -{})",
                    file.path, file.status, file.additions, file.deletions
                );
            }
        }
        if let Some(run) = &context.validation {
            let verdict = run.conclusion.as_deref().unwrap_or("pending");
            let _ = writeln!(out, "\nLatest validation run: {} ({})", verdict, run.html_url);
        }
        if !context.reviews.is_empty() {
            out.push_str("\n### Reviews\n");
            for review in &context.reviews {
                let _ = writeln!(out, "**{}** ({}):", review.author, review.state);
                if !review.body.trim().is_empty() {
                    let _ = writeln!(out, "{}", review.body.trim());
                }
            }
        }
        if !context.comments.is_empty() {
            out.push_str("\n### Pull request comments\n");
            for comment in &context.comments {
                write_comment(&mut out, comment, bot_login);
            }
        }
    }
    out
}

/// A user turn relaying `(author, body)` pairs of human feedback posted
/// since the last attempt.
pub fn feedback_message(items: &[(&str, &str)]) -> String {
    let mut out = String::from("New comments since your last update:\n");
    for (author, body) in items {
        let _ = writeln!(out, "\n**{}**:\n{}", author, body.trim());
    }
    out
}

pub fn handback_comment(pull_url: &str, summary: &str) -> String {
    let summary = summary.trim();
    let summary = if summary.is_empty() {
        "I pushed a change for this issue."
    } else {
        summary
    };
    format!(
        "{}\n\nThe change is ready for review: {}\n\n{}",
        summary, pull_url, HANDBACK_MARKER
    )
}

pub fn blocked_comment(limitation: &Limitation) -> String {
    format!(
        "I can't complete this task.\n\n**Reason:** {}\n\n**Missing capability:** {}\n\n\
         Reply here once this is resolved and I will pick the task up again.",
        limitation.reason.trim(),
        limitation.missing_capability.trim()
    )
}

/// Comment posted when the model finished without changing anything.
pub fn no_change_comment(summary: &str) -> String {
    let summary = summary.trim();
    if summary.is_empty() {
        "I looked into this and found nothing to change.".to_string()
    } else {
        summary.to_string()
    }
}

pub fn pull_title(task: &Task) -> String {
    format!("Fix #{}: {}", task.issue.number, task.issue.title)
}

pub fn pull_body(task: &Task, summary: &str) -> String {
    format!("{}\n\nCloses #{}.", summary.trim(), task.issue.number)
}

pub fn commit_message(task: &Task, summary: &str) -> String {
    let headline = summary
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Update files");
    let headline: String = headline.chars().take(72).collect();
    format!("{}\n\nRefs #{}", headline, task.issue.number)
}

fn write_comment(out: &mut String, comment: &Comment, bot_login: &str) {
    let who = if comment.author == bot_login {
        "you"
    } else {
        comment.author.as_str()
    };
    let body = comment.body.replace(HANDBACK_MARKER, "");
    let _ = writeln!(out, "\n**{}**:\n{}", who, body.trim());
}
