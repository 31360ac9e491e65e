//! Gitea webhook payload formatter.

use std::collections::HashMap;

use serde_json::Value;

use super::{first_line, short, Line, RepoNames};
use crate::irc::format::{
    bold, color, COLOR_BRANCH, COLOR_ID, COLOR_NEGATIVE, COLOR_POSITIVE, LIGHTBLUE,
};

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
    let ev = headers.get("X-Gitea-Event").cloned().unwrap_or_default();
    let mut tags = vec![ev.clone()];
    if let Some(action) = data.get("action").and_then(Value::as_str) {
        tags.push(format!("{ev}/{action}"));
    }
    tags
}

pub fn expand_category(category: &str) -> Vec<&str> {
    match category {
        "ping" => vec!["ping"],
        "code" => vec!["push"],
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
        ],
        "pr-all" => vec!["pull_request"],
        "issue-minimal" => vec![
            "issues/opened",
            "issues/closed",
            "issues/reopened",
            "issues/deleted",
        ],
        "issue" => vec![
            "issues/opened",
            "issues/closed",
            "issues/reopened",
            "issues/deleted",
            "issues/edited",
            "issues/assigned",
            "issues/unassigned",
            "issue_comment",
        ],
        "issue-all" => vec!["issues", "issue_comment"],
        "repo" => vec!["create", "delete", "release", "fork", "repository"],
        other => vec![other],
    }
}

pub fn render(_full_name: &str, event: &str, data: &Value) -> Vec<Line> {
    let lines = match event {
        "push" => push(data),
        "pull_request" => pull_request(data),
        "issues" => issues(data),
        "issue_comment" => issue_comment(data),
        "create" => create(data),
        "delete" => delete(data),
        "release" => release(data),
        "fork" => fork(data),
        // Repository create/delete events carry no useful line.
        "repository" => Some(Vec::new()),
        "ping" => Some(vec![("Received new webhook".to_string(), None)]),
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

fn push(data: &Value) -> Option<Vec<Line>> {
    let ref_name = data.get("ref")?.as_str()?;
    let branch = color(ref_name.rsplit('/').next().unwrap_or(ref_name), COLOR_BRANCH);
    let author = bold(data.pointer("/pusher/login")?.as_str()?);
    let empty = Vec::new();
    let commits = data
        .get("commits")
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    // Gitea push payloads carry per-commit URLs, so a small push gets one
    // line per commit instead of a summary.
    if commits.len() <= COMMIT_LIMIT {
        let mut outputs = Vec::new();
        for c in commits {
            let id = c.get("id")?.as_str()?;
            let hash = color(short(id), COLOR_ID);
            let msg = first_line(c.get("message")?.as_str()?);
            let url = c.get("url").and_then(Value::as_str).map(str::to_string);
            outputs.push((format!("{author} pushed {hash} to {branch}: {msg}"), url));
        }
        return Some(outputs);
    }

    let url = data
        .get("compare_url")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(vec![(
        format!("{author} pushed {} commits to {branch}", commits.len()),
        url,
    )])
}

fn pull_request(data: &Value) -> Option<Vec<Line>> {
    let pr = data.get("pull_request")?;
    let num = color(&format!("#{}", pr.get("number")?.as_u64()?), COLOR_ID);
    let action = data.get("action")?.as_str()?;
    let branch = color(pr.pointer("/base/ref")?.as_str()?, COLOR_BRANCH);
    let author = bold(data.pointer("/sender/login")?.as_str()?);
    let title = pr.get("title")?.as_str()?;
    let url = pr.get("html_url")?.as_str()?;
    let merged = pr.get("merged").and_then(Value::as_bool).unwrap_or(false);

    let desc = match action {
        "opened" => format!("requested {num} merge into {branch}"),
        "closed" if merged => format!("{} {num} into {branch}", color("merged", COLOR_POSITIVE)),
        "closed" => format!("{} {num}", color("closed", COLOR_NEGATIVE)),
        "ready_for_review" => format!("marked {num} ready for review"),
        "synchronize" => format!("committed to {num}"),
        other => format!("{other} {num}"),
    };
    Some(vec![(
        format!("[PR] {author} {desc}: {title}"),
        Some(url.to_string()),
    )])
}

fn issues(data: &Value) -> Option<Vec<Line>> {
    let number = data.pointer("/issue/number")?.as_u64()?;
    let num = color(&format!("#{number}"), COLOR_ID);
    let action = data.get("action")?.as_str()?;
    let title = data.pointer("/issue/title")?.as_str()?;
    let author = bold(data.pointer("/sender/login")?.as_str()?);
    let repo_url = data.pointer("/repository/html_url")?.as_str()?;
    Some(vec![(
        format!("[issue] {author} {action} {num}: {title}"),
        Some(format!("{repo_url}/issues/{number}")),
    )])
}

fn issue_comment(data: &Value) -> Option<Vec<Line>> {
    let body = data.pointer("/comment/body")?.as_str()?;
    if data.pointer("/changes/body/from").and_then(Value::as_str) == Some(body) {
        return None;
    }
    let num = color(
        &format!("#{}", data.pointer("/issue/number")?.as_u64()?),
        COLOR_ID,
    );
    let action = comment_action(data.get("action")?.as_str()?);
    let title = data.pointer("/issue/title")?.as_str()?;
    let kind = if data
        .pointer("/issue/pull_request")
        .map(|v| !v.is_null())
        .unwrap_or(false)
    {
        "PR"
    } else {
        "issue"
    };
    let commenter = bold(data.pointer("/sender/login")?.as_str()?);
    let url = data.pointer("/comment/html_url")?.as_str()?;
    Some(vec![(
        format!("[{kind}] {commenter} {action} on {num}: {title}"),
        Some(url.to_string()),
    )])
}

fn create(data: &Value) -> Option<Vec<Line>> {
    let ref_str = color(data.get("ref")?.as_str()?, COLOR_BRANCH);
    let sender = bold(data.pointer("/sender/login")?.as_str()?);
    let ref_type = data.get("ref_type")?.as_str()?;
    Some(vec![(
        format!("{sender} created a {ref_type}: {ref_str}"),
        None,
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
    let action = match data.get("action")?.as_str()? {
        "updated" | "published" => "published",
        "deleted" => "deleted",
        other => other,
    };
    let name = match data.pointer("/release/name").and_then(Value::as_str) {
        Some(n) if !n.is_empty() => format!(": {n}"),
        _ => String::new(),
    };
    let author = bold(data.pointer("/release/author/login")?.as_str()?);
    Some(vec![(format!("{author} {action} a release{name}"), None)])
}

fn fork(data: &Value) -> Option<Vec<Line>> {
    let forker = bold(data.pointer("/sender/login")?.as_str()?);
    let fork_name = color(data.pointer("/repository/full_name")?.as_str()?, LIGHTBLUE);
    let url = data.pointer("/repository/html_url")?.as_str()?;
    Some(vec![(
        format!("{forker} forked into {fork_name}"),
        Some(url.to_string()),
    )])
}
