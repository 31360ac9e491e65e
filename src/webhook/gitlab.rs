//! GitLab webhook payload formatter.

use std::collections::HashMap;

use serde_json::Value;

use super::{first_line, short, Line, RepoNames};
use crate::irc::format::{bold, color, COLOR_BRANCH, COLOR_ID, COLOR_NEGATIVE, COLOR_POSITIVE};

const COMMIT_LIMIT: usize = 3;

pub fn names(data: &Value) -> RepoNames {
    let full_name = match data
        .pointer("/project/path_with_namespace")
        .and_then(Value::as_str)
    {
        Some(path) => path.to_string(),
        None => data
            .get("project_name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .replace(' ', ""),
    };
    if full_name.is_empty() {
        return RepoNames::default();
    }

    let (mut owner, repo) = match full_name.split_once('/') {
        Some((o, r)) => (o.to_string(), Some(r.to_string())),
        None => (full_name.clone(), None),
    };
    // Subgroup paths like group/subgroup/project: the group is the
    // organisation and everything up to the project is the owner.
    let mut organisation = None;
    if full_name.matches('/').count() == 2 {
        organisation = Some(owner);
        owner = full_name
            .rsplit_once('/')
            .map(|(pre, _)| pre.to_string())
            .unwrap_or_default();
    }
    RepoNames {
        full_name: Some(full_name),
        owner: Some(owner),
        repo,
        organisation,
    }
}

pub fn branch(data: &Value) -> Option<String> {
    let r = data.get("ref")?.as_str()?;
    Some(r.rsplit('/').next().unwrap_or(r).to_string())
}

pub fn event(data: &Value, headers: &HashMap<String, String>) -> Vec<String> {
    // "Merge Request Hook" becomes "merge_request".
    let raw = headers.get("X-GitLab-Event").map(String::as_str).unwrap_or("");
    let ev = match raw.rsplit_once(' ') {
        Some((name, _)) => name,
        None => raw,
    }
    .to_lowercase()
    .replace(' ', "_");

    let oa = data.get("object_attributes");
    let action = oa
        .and_then(|v| v.get("action"))
        .and_then(Value::as_str);
    let qualified = oa
        .and_then(|v| v.get("noteable_type"))
        .and_then(Value::as_str)
        .map(|nt| format!("{ev}+{}", nt.to_lowercase()));

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
        "code" => vec!["push"],
        "pr-minimal" => vec![
            "merge_request/open",
            "merge_request/close",
            "merge_request/reopen",
            "merge_request/merge",
        ],
        "pr" => vec![
            "merge_request/open",
            "merge_request/close",
            "merge_request/reopen",
            "merge_request/update",
            "merge_request/merge",
            "note+mergerequest",
            "confidential_note+mergerequest",
        ],
        "pr-all" => vec![
            "merge_request",
            "note+mergerequest",
            "confidential_note+mergerequest",
        ],
        "issue-minimal" => vec![
            "issue/open",
            "issue/close",
            "issue/reopen",
            "confidential_issue/open",
            "confidential_issue/close",
            "confidential_issue/reopen",
        ],
        "issue" => vec![
            "issue/open",
            "issue/close",
            "issue/reopen",
            "issue/update",
            "confidential_issue/open",
            "confidential_issue/close",
            "confidential_issue/reopen",
            "confidential_issue/update",
            "note+issue",
            "confidential_note+issue",
        ],
        "issue-all" => vec![
            "issue",
            "confidential_issue",
            "note+issue",
            "confidential_note+issue",
        ],
        "repo" => vec!["tag_push"],
        other => vec![other],
    }
}

pub fn render(_full_name: &str, event: &str, data: &Value) -> Vec<Line> {
    let lines = match event {
        "push" => push(data),
        "tag_push" => tag_push(data),
        "merge_request" => merge_request(data),
        "issue" | "confidential_issue" => issues(data),
        "note" | "confidential_note" => note(data),
        "wiki_page" => wiki(data),
        _ => None,
    };
    lines.unwrap_or_default()
}

fn issue_action(action: &str) -> &str {
    match action {
        "open" => "opened",
        "close" => "closed",
        "reopen" => "reopened",
        "update" => "updated",
        "merge" => "merged",
        other => other,
    }
}

fn push(data: &Value) -> Option<Vec<Line>> {
    let ref_name = data.get("ref")?.as_str()?;
    let branch = color(ref_name.rsplit('/').next().unwrap_or(ref_name), COLOR_BRANCH);
    let author = bold(data.get("user_username")?.as_str()?);
    let empty = Vec::new();
    let commits = data
        .get("commits")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    let n = commits.len();

    if commits.is_empty() {
        return Some(vec![(format!("{author} pushed to {branch}"), None)]);
    }

    if n == 1 {
        let c = &commits[0];
        let id = c.get("id")?.as_str()?;
        let hash = color(short(id), COLOR_ID);
        let msg = first_line(c.get("message")?.as_str()?);
        let url = c.get("url").and_then(Value::as_str).map(str::to_string);
        return Some(vec![(
            format!("{author} pushed {hash} to {branch}: {msg}"),
            url,
        )]);
    }

    // GitLab push payloads carry no compare URL.
    let mut outputs = vec![(format!("{author} pushed {n} commits to {branch}"), None)];
    for c in commits.iter().take(COMMIT_LIMIT) {
        let id = c.get("id").and_then(Value::as_str).unwrap_or("");
        let msg = first_line(c.get("message").and_then(Value::as_str).unwrap_or(""));
        let url = c.get("url").and_then(Value::as_str).map(str::to_string);
        outputs.push((format!("{author} {} - {msg}", short(id)), url));
    }
    let hidden = n.saturating_sub(COMMIT_LIMIT);
    if hidden > 0 {
        let plural = if hidden != 1 { "s" } else { "" };
        outputs.push((format!("(+{hidden} hidden commit{plural})"), None));
    }
    Some(outputs)
}

fn tag_push(data: &Value) -> Option<Vec<Line>> {
    let after = data.get("after").and_then(Value::as_str).unwrap_or("");
    // An all-zero "after" hash means the tag was deleted.
    let created = after.chars().any(|c| c != '0');
    let ref_name = data.get("ref")?.as_str()?;
    let tag = color(ref_name.rsplit('/').next().unwrap_or(ref_name), COLOR_BRANCH);
    let author = bold(data.get("user_username")?.as_str()?);
    let action = if created { "created" } else { "deleted" };
    Some(vec![(format!("{author} {action} a tag: {tag}"), None)])
}

fn merge_request(data: &Value) -> Option<Vec<Line>> {
    let oa = data.get("object_attributes")?;
    let num = color(&format!("!{}", oa.get("iid")?.as_u64()?), COLOR_ID);
    let action = oa.get("action")?.as_str()?;
    let branch = color(oa.get("target_branch")?.as_str()?, COLOR_BRANCH);
    let author = bold(data.pointer("/user/username")?.as_str()?);
    let title = oa.get("title")?.as_str()?;
    let url = oa.get("url")?.as_str()?;

    let desc = match action {
        "open" => format!("requested {num} merge into {branch}"),
        "close" => format!("{} {num}", color("closed", COLOR_NEGATIVE)),
        "merge" => format!("{} {num} into {branch}", color("merged", COLOR_POSITIVE)),
        other => format!("{} {num}", issue_action(other)),
    };
    Some(vec![(
        format!("[MR] {author} {desc}: {title}"),
        Some(url.to_string()),
    )])
}

fn issues(data: &Value) -> Option<Vec<Line>> {
    let oa = data.get("object_attributes")?;
    let action = issue_action(oa.get("action")?.as_str()?);
    let num = color(&format!("#{}", oa.get("iid")?.as_u64()?), COLOR_ID);
    let title = oa.get("title")?.as_str()?;
    let author = bold(data.pointer("/user/username")?.as_str()?);
    let url = oa.get("url")?.as_str()?;
    Some(vec![(
        format!("[issue] {author} {action} {num}: {title}"),
        Some(url.to_string()),
    )])
}

fn note(data: &Value) -> Option<Vec<Line>> {
    let oa = data.get("object_attributes")?;
    let (obj, label) = match oa.get("noteable_type").and_then(Value::as_str) {
        Some("Issue") => (data.get("issue")?, "issue"),
        Some("MergeRequest") => (data.get("merge_request")?, "MR"),
        _ => return None,
    };
    let num = color(&format!("#{}", obj.get("iid")?.as_u64()?), COLOR_ID);
    let title = obj.get("title")?.as_str()?;
    let commenter = bold(data.pointer("/user/username")?.as_str()?);
    let url = oa.get("url")?.as_str()?;
    Some(vec![(
        format!("[{label}] {commenter} commented on {num}: {title}"),
        Some(url.to_string()),
    )])
}

fn wiki(data: &Value) -> Option<Vec<Line>> {
    let oa = data.get("object_attributes")?;
    let author = bold(data.pointer("/user/username")?.as_str()?);
    let action = match oa.get("action")?.as_str()? {
        "create" => "created",
        "update" => "updated",
        "delete" => "deleted",
        other => other,
    };
    let title = oa.get("title")?.as_str()?;
    let url = oa.get("url")?.as_str()?;
    Some(vec![(
        format!("{author} {action} a wiki page: {title}"),
        Some(url.to_string()),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(event: &str) -> HashMap<String, String> {
        HashMap::from([("X-GitLab-Event".to_string(), event.to_string())])
    }

    #[test]
    fn event_normalises_hook_name() {
        let data = json!({"object_attributes": {"action": "open"}});
        assert_eq!(
            event(&data, &headers("Merge Request Hook")),
            ["merge_request", "merge_request/open"]
        );
    }

    #[test]
    fn note_event_gets_noteable_tag() {
        let data = json!({"object_attributes": {"noteable_type": "MergeRequest"}});
        assert_eq!(
            event(&data, &headers("Note Hook")),
            ["note", "note+mergerequest"]
        );
    }

    #[test]
    fn names_handle_subgroups() {
        let data = json!({"project": {"path_with_namespace": "group/sub/proj"}});
        let n = names(&data);
        assert_eq!(n.full_name.as_deref(), Some("group/sub/proj"));
        assert_eq!(n.owner.as_deref(), Some("group/sub"));
        assert_eq!(n.organisation.as_deref(), Some("group"));
    }

    #[test]
    fn names_fall_back_to_project_name() {
        let data = json!({"project_name": "Acme / Widgets"});
        let n = names(&data);
        assert_eq!(n.full_name.as_deref(), Some("Acme/Widgets"));
        assert_eq!(n.owner.as_deref(), Some("Acme"));
    }

    #[test]
    fn push_without_commits() {
        let data = json!({"ref": "refs/heads/main", "user_username": "alice"});
        let lines = render("a/b", "push", &data);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].0.contains("pushed to"));
    }

    #[test]
    fn tag_push_detects_deletion() {
        let deleted = json!({
            "ref": "refs/tags/v1.0",
            "after": "0000000000",
            "user_username": "alice",
        });
        let lines = render("a/b", "tag_push", &deleted);
        assert!(lines[0].0.contains("deleted a tag"));

        let created = json!({
            "ref": "refs/tags/v1.0",
            "after": "abc123",
            "user_username": "alice",
        });
        let lines = render("a/b", "tag_push", &created);
        assert!(lines[0].0.contains("created a tag"));
    }

    #[test]
    fn merge_request_uses_bang_numbers() {
        let data = json!({
            "user": {"username": "carol"},
            "object_attributes": {
                "iid": 7,
                "action": "merge",
                "target_branch": "main",
                "title": "Do things",
                "url": "https://gitlab.example/mr/7",
            },
        });
        let lines = render("a/b", "merge_request", &data);
        assert!(lines[0].0.contains("!7"));
        assert!(lines[0].0.contains("merged"));
    }

    #[test]
    fn note_on_unknown_noteable_is_silent() {
        let data = json!({
            "user": {"username": "carol"},
            "object_attributes": {"noteable_type": "Snippet", "url": "u"},
        });
        assert!(render("a/b", "note", &data).is_empty());
    }
}
