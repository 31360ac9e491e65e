//! GitHub webhook payload formatter.

use std::collections::HashMap;

use serde_json::Value;

use super::{first_line, short, Line, RepoNames};
use crate::irc::format::{
    bold, color, COLOR_BRANCH, COLOR_ID, COLOR_NEGATIVE, COLOR_POSITIVE, LIGHTBLUE, RED,
};

const COMMENT_MAX: usize = 100;
const COMMIT_LIMIT: usize = 3;

pub fn names(data: &Value) -> RepoNames {
    let mut names = RepoNames::default();
    if let Some(full) = data
        .pointer("/repository/full_name")
        .and_then(Value::as_str)
    {
        names.full_name = Some(full.to_string());
        if let Some((owner, repo)) = full.split_once('/') {
            names.owner = Some(owner.to_string());
            names.repo = Some(repo.to_string());
        }
    }
    if let Some(org) = data.pointer("/organization/login").and_then(Value::as_str) {
        names.organisation = Some(org.to_string());
    }
    names
}

pub fn branch(data: &Value) -> Option<String> {
    let r = data.get("ref")?.as_str()?;
    Some(r.rsplit('/').next().unwrap_or(r).to_string())
}

pub fn event(data: &Value, headers: &HashMap<String, String>) -> Vec<String> {
    let ev = headers
        .get("X-GitHub-Event")
        .cloned()
        .unwrap_or_default();
    let action = data.get("action").and_then(Value::as_str);
    let qualified = if let Some(state) = data.pointer("/review/state").and_then(Value::as_str) {
        Some(format!("{ev}+{state}"))
    } else {
        data.pointer("/check_suite/conclusion")
            .and_then(Value::as_str)
            .map(|c| format!("{ev}+{c}"))
    };

    let mut tags = vec![ev.clone()];
    if let Some(action) = action {
        tags.push(format!("{ev}/{action}"));
    }
    if let Some(q) = qualified {
        if let Some(action) = action {
            tags.push(q.clone());
            tags.push(format!("{q}/{action}"));
        } else {
            tags.push(q);
        }
    }
    tags
}

pub fn expand_category(category: &str) -> Vec<&str> {
    match category {
        "ping" => vec!["ping"],
        "code" => vec!["push", "commit_comment"],
        "pr-minimal" => vec![
            "pull_request/opened",
            "pull_request/closed",
            "pull_request/reopened",
        ],
        "pr" => vec![
            "pull_request/opened",
            "pull_request/closed",
            "pull_request/reopened",
            "pull_request/edited",
            "pull_request/assigned",
            "pull_request/unassigned",
            "pull_request_review",
            "pull_request/locked",
            "pull_request/unlocked",
            "pull_request_review_comment",
        ],
        "pr-all" => vec![
            "pull_request",
            "pull_request_review",
            "pull_request_review_comment",
        ],
        "issue-minimal" => vec![
            "issues/opened",
            "issues/closed",
            "issues/reopened",
            "issues/deleted",
            "issues/transferred",
        ],
        "issue" => vec![
            "issues/opened",
            "issues/closed",
            "issues/reopened",
            "issues/deleted",
            "issues/edited",
            "issues/assigned",
            "issues/unassigned",
            "issues/locked",
            "issues/unlocked",
            "issues/transferred",
            "issue_comment",
        ],
        "issue-all" => vec!["issues", "issue_comment"],
        "repo" => vec!["create", "delete", "release", "fork"],
        "star" => vec!["watch"],
        other => vec![other],
    }
}

pub fn render(full_name: &str, event: &str, data: &Value) -> Vec<Line> {
    let lines = match event {
        "push" => push(full_name, data),
        "commit_comment" => commit_comment(data),
        "pull_request" => pull_request(data),
        "pull_request_review" => pr_review(data),
        "pull_request_review_comment" => pr_review_comment(data),
        "issue_comment" => issue_comment(data),
        "issues" => issues(data),
        "create" => create(full_name, data),
        "delete" => delete(data),
        "release" => release(data),
        "fork" => fork(data),
        "ping" => Some(vec![("Received new webhook".to_string(), None)]),
        "watch" => watch(data),
        "membership" => membership(data),
        _ => None,
    };
    lines.unwrap_or_default()
}

fn comment_action(action: &str) -> &str {
    match action {
        "created" => "commented",
        "edited" => "edited a comment",
        "deleted" => "deleted a comment",
        other => other,
    }
}

/// First line of a comment body, cut at a word boundary near 100 chars.
fn comment_snippet(body: &str) -> String {
    let line = first_line(body);
    if line.chars().count() <= COMMENT_MAX {
        return line.to_string();
    }
    let cut: String = line.chars().take(COMMENT_MAX).collect();
    let left = match cut.rfind(' ') {
        Some(i) => &cut[..i],
        None => cut.as_str(),
    };
    format!("{left}[...]")
}

fn push(full_name: &str, data: &Value) -> Option<Vec<Line>> {
    let ref_name = data.get("ref")?.as_str()?;
    let branch = color(ref_name.splitn(3, '/').nth(2).unwrap_or(ref_name), COLOR_BRANCH);
    let author = bold(data.pointer("/pusher/name")?.as_str()?);
    let forced = data.get("forced").and_then(Value::as_bool).unwrap_or(false);
    let empty = Vec::new();
    let commits = data
        .get("commits")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    let forced_str = if forced {
        format!("{} ", color("force", RED))
    } else {
        String::new()
    };

    if commits.is_empty() && forced {
        return Some(vec![(
            format!("{author} {forced_str}pushed to {branch}"),
            None,
        )]);
    }

    let range_url = match (
        data.get("before").and_then(Value::as_str),
        commits.last().and_then(|c| c.get("id")).and_then(Value::as_str),
    ) {
        (Some(before), Some(last)) => Some(format!(
            "https://github.com/{full_name}/compare/{before}...{last}"
        )),
        _ => None,
    };

    let n = commits.len();
    if n == 1 {
        let c = &commits[0];
        let id = c.get("id")?.as_str()?;
        let hash = color(short(id), COLOR_ID);
        let msg = first_line(c.get("message")?.as_str()?);
        let url = format!("https://github.com/{full_name}/commit/{id}");
        return Some(vec![(
            format!("{author} {forced_str}pushed {hash} to {branch}: {msg}"),
            Some(url),
        )]);
    }

    let mut outputs = vec![(
        format!("{author} {forced_str}pushed {n} commits to {branch}"),
        range_url,
    )];
    for c in commits.iter().take(COMMIT_LIMIT) {
        let id = c.get("id").and_then(Value::as_str).unwrap_or("");
        let msg = first_line(c.get("message").and_then(Value::as_str).unwrap_or(""));
        outputs.push((format!("{author} {} - {msg}", short(id)), None));
    }
    let hidden = n.saturating_sub(COMMIT_LIMIT);
    if hidden > 0 {
        let plural = if hidden != 1 { "s" } else { "" };
        outputs.push((format!("(+{hidden} hidden commit{plural})"), None));
    }
    Some(outputs)
}

fn commit_comment(data: &Value) -> Option<Vec<Line>> {
    let action = data.get("action")?.as_str()?;
    let commit = short(data.pointer("/comment/commit_id")?.as_str()?);
    let commenter = bold(data.pointer("/comment/user/login")?.as_str()?);
    let url = data.pointer("/comment/html_url")?.as_str()?;
    Some(vec![(
        format!("[commit/{commit}] {commenter} {action} a comment"),
        Some(url.to_string()),
    )])
}

fn pull_request(data: &Value) -> Option<Vec<Line>> {
    let pr = data.get("pull_request")?;
    let num = color(&format!("#{}", pr.get("number")?.as_u64()?), COLOR_ID);
    let author = bold(pr.pointer("/user/login")?.as_str()?);
    let sender = bold(data.pointer("/sender/login")?.as_str()?);
    let branch = color(pr.pointer("/base/ref")?.as_str()?, COLOR_BRANCH);
    let action = data.get("action")?.as_str()?;
    let title = pr.get("title")?.as_str()?;
    let url = pr.get("html_url")?.as_str()?;
    let merged = pr.get("merged").and_then(Value::as_bool).unwrap_or(false);
    let renamed = data.pointer("/changes/title").is_some();

    let desc = match action {
        "opened" => format!("requested {num} merge into {branch}"),
        "closed" if merged => {
            format!("{} {num} by {author} into {branch}", color("merged", COLOR_POSITIVE))
        }
        "closed" => format!("{} {num} by {author}", color("closed", COLOR_NEGATIVE)),
        "ready_for_review" => format!("marked {num} ready for review"),
        "synchronize" => format!("committed to {num} by {author}"),
        "labeled" => format!("labeled {num} as '{}'", data.pointer("/label/name")?.as_str()?),
        "edited" if renamed => format!("renamed {num}"),
        other => format!("{other} {num} by {author}"),
    };
    Some(vec![(
        format!("[PR] {sender} {desc}: {title}"),
        Some(url.to_string()),
    )])
}

fn pr_review(data: &Value) -> Option<Vec<Line>> {
    if data.get("action")?.as_str()? != "submitted" {
        return None;
    }
    let review = data.get("review")?;
    review.get("submitted_at")?;
    let state = review.get("state")?.as_str()?;
    if state == "commented" {
        return None;
    }
    let num = color(
        &format!("#{}", data.pointer("/pull_request/number")?.as_u64()?),
        COLOR_ID,
    );
    let title = data.pointer("/pull_request/title")?.as_str()?;
    let reviewer = bold(data.pointer("/sender/login")?.as_str()?);
    let url = review.get("html_url")?.as_str()?;
    let verb = match state {
        "approved" => "approved changes",
        "changes_requested" => "requested changes",
        "dismissed" => "dismissed a review",
        other => other,
    };
    Some(vec![(
        format!("[PR] {reviewer} {verb} on {num}: {title}"),
        Some(url.to_string()),
    )])
}

fn pr_review_comment(data: &Value) -> Option<Vec<Line>> {
    let num = color(
        &format!("#{}", data.pointer("/pull_request/number")?.as_u64()?),
        COLOR_ID,
    );
    let action = comment_action(data.get("action")?.as_str()?);
    let title = data.pointer("/pull_request/title")?.as_str()?;
    let sender = bold(data.pointer("/sender/login")?.as_str()?);
    let url = data.pointer("/comment/html_url")?.as_str()?;
    Some(vec![(
        format!("[PR] {sender} {action} on a review on {num}: {title}"),
        Some(url.to_string()),
    )])
}

fn issues(data: &Value) -> Option<Vec<Line>> {
    let num = color(
        &format!("#{}", data.pointer("/issue/number")?.as_u64()?),
        COLOR_ID,
    );
    let action = data.get("action")?.as_str()?;
    let renamed = data.pointer("/changes/title").is_some();
    let action_str = match action {
        "labeled" => format!("labeled {num} as '{}'", data.pointer("/label/name")?.as_str()?),
        "edited" if renamed => format!("renamed {num}"),
        other => format!("{other} {num}"),
    };
    let author = bold(data.pointer("/sender/login")?.as_str()?);
    let title = data.pointer("/issue/title")?.as_str()?;
    let url = data.pointer("/issue/html_url")?.as_str()?;
    Some(vec![(
        format!("[issue] {author} {action_str}: {title}"),
        Some(url.to_string()),
    )])
}

fn issue_comment(data: &Value) -> Option<Vec<Line>> {
    let body = data.pointer("/comment/body")?.as_str()?;
    // Edits that did not change the body are noise.
    if data.pointer("/changes/body/from").and_then(Value::as_str) == Some(body) {
        return None;
    }
    let num = color(
        &format!("#{}", data.pointer("/issue/number")?.as_u64()?),
        COLOR_ID,
    );
    let action = data.get("action")?.as_str()?;
    let title = data.pointer("/issue/title")?.as_str()?;
    let kind = if data.pointer("/issue/pull_request").is_some() {
        "PR"
    } else {
        "issue"
    };
    let commenter = bold(data.pointer("/sender/login")?.as_str()?);
    let url = data.pointer("/comment/html_url")?.as_str()?;
    let snippet = if action != "deleted" {
        format!(": {}", comment_snippet(body))
    } else {
        String::new()
    };
    Some(vec![(
        format!(
            "[{kind}] {commenter} {} on {num} ({title}){snippet}",
            comment_action(action)
        ),
        Some(url.to_string()),
    )])
}

fn create(full_name: &str, data: &Value) -> Option<Vec<Line>> {
    let raw_ref = data.get("ref")?.as_str()?;
    let ref_str = color(raw_ref, COLOR_BRANCH);
    let sender = bold(data.pointer("/sender/login")?.as_str()?);
    let ref_type = data.get("ref_type")?.as_str()?;
    let url = format!("https://github.com/{full_name}/tree/{raw_ref}");
    Some(vec![(
        format!("{sender} created a {ref_type}: {ref_str}"),
        Some(url),
    )])
}

fn delete(data: &Value) -> Option<Vec<Line>> {
    let ref_str = color(data.get("ref")?.as_str()?, COLOR_BRANCH);
    let sender = bold(data.pointer("/sender/login")?.as_str()?);
    let ref_type = data.get("ref_type")?.as_str()?;
    Some(vec![(
        format!("{sender} deleted a {ref_type}: {ref_str}"),
        None,
    )])
}

fn release(data: &Value) -> Option<Vec<Line>> {
    let action = data.get("action")?.as_str()?;
    let name = match data.pointer("/release/name").and_then(Value::as_str) {
        Some(n) if !n.is_empty() => format!(": {n}"),
        _ => String::new(),
    };
    let author = bold(data.pointer("/release/author/login")?.as_str()?);
    let url = data.pointer("/release/html_url")?.as_str()?;
    Some(vec![(
        format!("{author} {action} a release{name}"),
        Some(url.to_string()),
    )])
}

fn fork(data: &Value) -> Option<Vec<Line>> {
    let forker = bold(data.pointer("/sender/login")?.as_str()?);
    let fork_name = color(data.pointer("/forkee/full_name")?.as_str()?, LIGHTBLUE);
    let url = data.pointer("/forkee/html_url")?.as_str()?;
    Some(vec![(
        format!("{forker} forked into {fork_name}"),
        Some(url.to_string()),
    )])
}

fn watch(data: &Value) -> Option<Vec<Line>> {
    let sender = data.pointer("/sender/login")?.as_str()?;
    Some(vec![(format!("{sender} starred the repository"), None)])
}

fn membership(data: &Value) -> Option<Vec<Line>> {
    let sender = data.pointer("/sender/login")?.as_str()?;
    let action = data.get("action")?.as_str()?;
    let member = data.pointer("/member/login")?.as_str()?;
    let team = data.pointer("/team/name")?.as_str()?;
    Some(vec![(
        format!("{sender} {action} {member} to team {team}"),
        None,
    )])
}
