use base64::Engine as _;
use cookgate_contracts::COMMITTER_SIGNATURE;
use cookgate_pkg::percent_encode;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::api::Api;
use crate::{
    Committer, Content, DirEntry, FileContent, HostConfig, HostKind, VcsError, VcsHost, VcsResult,
};

const DEFAULT_API_URL: &str = "https://api.github.com/";
const DIFF_MEDIA_TYPE: &str = "application/vnd.github.v3.diff";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsReply {
    Directory(Vec<ContentsEntry>),
    File(ContentsEntry),
}

#[derive(Debug, Deserialize)]
struct ContentsEntry {
    path: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitReply {
    commit: ShaOnly,
}

#[derive(Debug, Deserialize)]
struct ShaOnly {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefReply {
    object: ShaOnly,
}

#[derive(Debug, Deserialize)]
struct RepoReply {
    #[serde(default)]
    default_branch: Option<String>,
}

/// GitHub (or GitHub Enterprise) REST v3 backend scoped to one organization.
#[derive(Debug, Clone)]
pub struct GitHubHost {
    api: Api,
}

impl GitHubHost {
    pub fn new(org: &str, config: &HostConfig) -> VcsResult<Self> {
        let base = config.server_url.as_deref().unwrap_or(DEFAULT_API_URL);
        let api = Api::new(
            HostKind::Github,
            org,
            base,
            config.ssl_no_verify,
            ("Authorization", format!("Bearer {}", config.token)),
            "application/vnd.github+json",
        )?;
        Ok(Self { api })
    }

    fn repo_url(&self, repo: &str, rest: &str) -> VcsResult<Url> {
        let mut rel = format!(
            "repos/{}/{}",
            percent_encode(&self.api.owner, true),
            percent_encode(repo, true)
        );
        if !rest.is_empty() {
            rel.push('/');
            rel.push_str(rest);
        }
        self.api.url(&rel)
    }

    fn write_file(
        &self,
        method: &str,
        repo: &str,
        path: &str,
        body: Value,
        allowed: &[u16],
        action: &str,
    ) -> VcsResult<String> {
        let url = self.repo_url(repo, &format!("contents/{}", percent_encode(path, false)))?;
        let resp = self.api.call(method, &url, Some(&body), None, action)?;
        let body = self.api.expect(resp, allowed, action)?;
        let reply: CommitReply = self.api.json(&body, action)?;
        Ok(reply.commit.sha)
    }

    fn default_branch(&self, repo: &str) -> VcsResult<Option<String>> {
        let action = format!("retrieve repo {repo}");
        let reply: Option<RepoReply> = self.api.get_optional(&self.repo_url(repo, "")?, &action)?;
        Ok(reply.map(|r| r.default_branch.unwrap_or_else(|| "master".to_string())))
    }
}

fn committer_json(c: &Committer) -> Value {
    json!({ "name": c.name, "email": c.mail })
}

impl VcsHost for GitHubHost {
    fn kind(&self) -> HostKind {
        HostKind::Github
    }

    fn owner(&self) -> &str {
        &self.api.owner
    }

    fn get_content(&self, repo: &str, path: &str) -> VcsResult<Content> {
        let action = format!("retrieve file {path}");
        let url = self.repo_url(repo, &format!("contents/{}", percent_encode(path, false)))?;
        let Some(reply) = self.api.get_optional::<ContentsReply>(&url, &action)? else {
            return Ok(Content::Missing);
        };
        match reply {
            ContentsReply::Directory(entries) => Ok(Content::Directory(
                entries
                    .into_iter()
                    .map(|e| DirEntry {
                        path: e.path,
                        sha: e.sha,
                    })
                    .collect(),
            )),
            ContentsReply::File(entry) => {
                let encoded: String = entry
                    .content
                    .unwrap_or_default()
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .collect();
                let content = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| VcsError::Decode {
                        action: format!("decode file {path}"),
                        message: e.to_string(),
                    })?;
                Ok(Content::File(FileContent {
                    content,
                    sha: entry.sha,
                }))
            }
        }
    }

    fn create_file(
        &self,
        repo: &str,
        path: &str,
        message: &str,
        committer: &Committer,
        content: &[u8],
    ) -> VcsResult<String> {
        let body = json!({
            "message": message,
            "committer": committer_json(committer),
            "content": base64::engine::general_purpose::STANDARD.encode(content),
        });
        self.write_file("PUT", repo, path, body, &[201], &format!("create file {path}"))
    }

    fn update_file(
        &self,
        repo: &str,
        path: &str,
        sha: &str,
        message: &str,
        committer: &Committer,
        content: &[u8],
    ) -> VcsResult<String> {
        let body = json!({
            "message": message,
            "committer": committer_json(committer),
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "sha": sha,
        });
        self.write_file("PUT", repo, path, body, &[200], &format!("update file {path}"))
    }

    fn delete_file(
        &self,
        repo: &str,
        path: &str,
        sha: &str,
        message: &str,
        committer: &Committer,
    ) -> VcsResult<String> {
        let body = json!({
            "message": message,
            "committer": committer_json(committer),
            "sha": sha,
        });
        self.write_file("DELETE", repo, path, body, &[200], &format!("delete file {path}"))
    }

    fn get_diff(&self, repo: &str, sha: &str) -> VcsResult<String> {
        let action = format!("retrieve commit {sha}");
        let url = self.repo_url(repo, &format!("commits/{}", percent_encode(sha, true)))?;
        let resp = self
            .api
            .call("GET", &url, None, Some(DIFF_MEDIA_TYPE), &action)?;
        let body = self.api.expect(resp, &[200], &action)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn archive_link(&self, repo: &str, reference: Option<&str>) -> VcsResult<Option<Url>> {
        let Some(default_branch) = self.default_branch(repo)? else {
            return Ok(None);
        };
        let reference = reference.map(str::to_string).unwrap_or(default_branch);
        self.repo_url(repo, &format!("tarball/{}", percent_encode(&reference, false)))
            .map(Some)
    }

    fn download_archive(&self, link: &Url) -> VcsResult<Vec<u8>> {
        self.api.download(link)
    }

    fn tag_exists(&self, repo: &str, tag: &str) -> VcsResult<bool> {
        let action = format!("retrieve tags of repo {repo}");
        let url = self.repo_url(repo, &format!("git/ref/tags/{}", percent_encode(tag, false)))?;
        let reply: Option<RefReply> = self.api.get_optional(&url, &action)?;
        Ok(reply.is_some())
    }

    fn create_tag(&self, repo: &str, tag: &str, tagger: &Committer) -> VcsResult<()> {
        let action = format!("create tag {tag} for repo {repo}");
        let branch = self
            .default_branch(repo)?
            .ok_or_else(|| VcsError::Status {
                action: action.clone(),
                status: 404,
                message: format!("repo {repo} not found"),
            })?;

        let head_url = self.repo_url(repo, &format!("git/ref/heads/{}", percent_encode(&branch, false)))?;
        let resp = self.api.call("GET", &head_url, None, None, &action)?;
        let head: RefReply = self.api.json(&self.api.expect(resp, &[200], &action)?, &action)?;

        let tag_body = json!({
            "tag": tag,
            "message": format!("Tagged by {COMMITTER_SIGNATURE}\n"),
            "object": head.object.sha,
            "type": "commit",
            "tagger": committer_json(tagger),
        });
        let resp = self
            .api
            .call("POST", &self.repo_url(repo, "git/tags")?, Some(&tag_body), None, &action)?;
        let tag_obj: ShaOnly = self.api.json(&self.api.expect(resp, &[201], &action)?, &action)?;

        let ref_body = json!({ "ref": format!("refs/tags/{tag}"), "sha": tag_obj.sha });
        let resp = self
            .api
            .call("POST", &self.repo_url(repo, "git/refs")?, Some(&ref_body), None, &action)?;
        self.api.expect(resp, &[201], &action)?;
        tracing::info!(org = %self.api.owner, repo, tag, "created tag");
        Ok(())
    }

    fn delete_tag(&self, repo: &str, tag: &str) -> VcsResult<()> {
        let action = format!("delete tag {tag}");
        let url = self.repo_url(repo, &format!("git/refs/tags/{}", percent_encode(tag, false)))?;
        let resp = self.api.call("DELETE", &url, None, None, &action)?;
        self.api.expect(resp, &[204], &action)?;
        tracing::info!(org = %self.api.owner, repo, tag, "deleted tag");
        Ok(())
    }
}
