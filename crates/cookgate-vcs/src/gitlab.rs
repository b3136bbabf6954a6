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

const DEFAULT_SERVER_URL: &str = "https://gitlab.com/";

#[derive(Debug, Deserialize)]
struct TreeEntry {
    id: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct FileReply {
    content: String,
    #[serde(default)]
    encoding: String,
    #[serde(default)]
    last_commit_id: String,
}

#[derive(Debug, Deserialize)]
struct ProjectReply {
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitReply {
    id: String,
}

/// GitLab REST v4 backend scoped to one group. Writes go to the project's default branch.
#[derive(Debug, Clone)]
pub struct GitLabHost {
    api: Api,
    /// Web root, used for the `.diff` view which is not part of the API.
    web: Url,
}

impl GitLabHost {
    pub fn new(group: &str, config: &HostConfig) -> VcsResult<Self> {
        let server = config.server_url.as_deref().unwrap_or(DEFAULT_SERVER_URL);
        let server = server.trim_end_matches('/');
        let server = server.strip_suffix("/api/v4").unwrap_or(server);
        let api = Api::new(
            HostKind::Gitlab,
            group,
            &format!("{server}/api/v4"),
            config.ssl_no_verify,
            ("PRIVATE-TOKEN", config.token.clone()),
            "application/json",
        )?;
        let web = Url::parse(&format!("{server}/")).map_err(|e| VcsError::Config {
            host: HostKind::Gitlab,
            message: format!("parse server url {server:?}: {e}"),
        })?;
        Ok(Self { api, web })
    }

    fn project_url(&self, project: &str, rest: &str) -> VcsResult<Url> {
        let id = percent_encode(&format!("{}/{project}", self.api.owner), true);
        let mut rel = format!("projects/{id}");
        if !rest.is_empty() {
            rel.push('/');
            rel.push_str(rest);
        }
        self.api.url(&rel)
    }

    fn file_url(&self, project: &str, path: &str) -> VcsResult<Url> {
        self.project_url(
            project,
            &format!("repository/files/{}", percent_encode(path, true)),
        )
    }

    fn default_branch(&self, project: &str) -> VcsResult<Option<String>> {
        let action = format!("retrieve project {project}");
        let reply: Option<ProjectReply> = self
            .api
            .get_optional(&self.project_url(project, "")?, &action)?;
        Ok(reply.map(|p| p.default_branch.unwrap_or_else(|| "master".to_string())))
    }

    fn branch_of(&self, project: &str, action: &str) -> VcsResult<String> {
        self.default_branch(project)?.ok_or_else(|| VcsError::Status {
            action: action.to_string(),
            status: 404,
            message: format!("project {project} not found"),
        })
    }

    fn sha_of_latest_commit(&self, project: &str, branch: &str) -> VcsResult<String> {
        let action = "retrieve SHA of latest commit";
        let url = self.project_url(
            project,
            &format!("repository/commits/{}", percent_encode(branch, true)),
        )?;
        let resp = self.api.call("GET", &url, None, None, action)?;
        let commit: CommitReply = self.api.json(&self.api.expect(resp, &[200], action)?, action)?;
        Ok(commit.id)
    }

    fn write_file(
        &self,
        method: &str,
        project: &str,
        path: &str,
        mut body: Value,
        allowed: &[u16],
        action: &str,
    ) -> VcsResult<String> {
        let branch = self.branch_of(project, action)?;
        body["branch"] = Value::String(branch.clone());
        let resp = self
            .api
            .call(method, &self.file_url(project, path)?, Some(&body), None, action)?;
        self.api.expect(resp, allowed, action)?;
        self.sha_of_latest_commit(project, &branch)
    }
}

fn author_fields(body: &mut Value, c: &Committer) {
    body["author_name"] = Value::String(c.name.clone());
    body["author_email"] = Value::String(c.mail.clone());
}

impl VcsHost for GitLabHost {
    fn kind(&self) -> HostKind {
        HostKind::Gitlab
    }

    fn owner(&self) -> &str {
        &self.api.owner
    }

    fn get_content(&self, project: &str, path: &str) -> VcsResult<Content> {
        let action = format!("retrieve tree for {path}");
        let Some(branch) = self.default_branch(project)? else {
            return Ok(Content::Missing);
        };
        let mut tree_url = self.project_url(project, "repository/tree")?;
        tree_url
            .query_pairs_mut()
            .append_pair("path", path)
            .append_pair("ref", &branch);
        let tree: Option<Vec<TreeEntry>> = self.api.get_optional(&tree_url, &action)?;
        if let Some(tree) = tree.filter(|t| !t.is_empty()) {
            return Ok(Content::Directory(
                tree.into_iter()
                    .map(|e| DirEntry {
                        path: e.path,
                        sha: e.id,
                    })
                    .collect(),
            ));
        }

        let action = format!("retrieve file {path}");
        let mut file_url = self.file_url(project, path)?;
        file_url.query_pairs_mut().append_pair("ref", &branch);
        let Some(file) = self.api.get_optional::<FileReply>(&file_url, &action)? else {
            return Ok(Content::Missing);
        };
        let content = if file.encoding == "base64" {
            base64::engine::general_purpose::STANDARD
                .decode(file.content.trim())
                .map_err(|e| VcsError::Decode {
                    action: format!("decode file {path}"),
                    message: e.to_string(),
                })?
        } else {
            file.content.into_bytes()
        };
        Ok(Content::File(FileContent {
            content,
            sha: file.last_commit_id,
        }))
    }

    fn create_file(
        &self,
        project: &str,
        path: &str,
        message: &str,
        committer: &Committer,
        content: &[u8],
    ) -> VcsResult<String> {
        let mut body = json!({
            "commit_message": message,
            "encoding": "base64",
            "content": base64::engine::general_purpose::STANDARD.encode(content),
        });
        author_fields(&mut body, committer);
        self.write_file("POST", project, path, body, &[201], &format!("create file {path}"))
    }

    fn update_file(
        &self,
        project: &str,
        path: &str,
        _sha: &str,
        message: &str,
        committer: &Committer,
        content: &[u8],
    ) -> VcsResult<String> {
        let mut body = json!({
            "commit_message": message,
            "encoding": "base64",
            "content": base64::engine::general_purpose::STANDARD.encode(content),
        });
        author_fields(&mut body, committer);
        self.write_file("PUT", project, path, body, &[200], &format!("update file {path}"))
    }

    fn delete_file(
        &self,
        project: &str,
        path: &str,
        _sha: &str,
        message: &str,
        committer: &Committer,
    ) -> VcsResult<String> {
        let mut body = json!({ "commit_message": message });
        author_fields(&mut body, committer);
        self.write_file(
            "DELETE",
            project,
            path,
            body,
            &[200, 204],
            &format!("delete file {path}"),
        )
    }

    fn get_diff(&self, project: &str, sha: &str) -> VcsResult<String> {
        let action = format!("retrieve commit {sha}");
        let rel = format!(
            "{}/{}/commit/{}.diff",
            percent_encode(&self.api.owner, true),
            percent_encode(project, true),
            percent_encode(sha, true)
        );
        let url = self.web.join(&rel).map_err(|e| VcsError::Config {
            host: HostKind::Gitlab,
            message: format!("build diff url: {e}"),
        })?;
        let resp = self.api.call("GET", &url, None, Some("text/plain"), &action)?;
        let body = self.api.expect(resp, &[200], &action)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn archive_link(&self, project: &str, reference: Option<&str>) -> VcsResult<Option<Url>> {
        let Some(default_branch) = self.default_branch(project)? else {
            return Ok(None);
        };
        let mut url = self.project_url(project, "repository/archive.tar.gz")?;
        url.query_pairs_mut()
            .append_pair("sha", reference.unwrap_or(&default_branch));
        Ok(Some(url))
    }

    fn download_archive(&self, link: &Url) -> VcsResult<Vec<u8>> {
        self.api.download(link)
    }

    fn tag_exists(&self, project: &str, tag: &str) -> VcsResult<bool> {
        let action = format!("retrieve tags of project {project}");
        let url = self.project_url(
            project,
            &format!("repository/tags/{}", percent_encode(tag, true)),
        )?;
        let reply: Option<Value> = self.api.get_optional(&url, &action)?;
        Ok(reply.is_some())
    }

    fn create_tag(&self, project: &str, tag: &str, tagger: &Committer) -> VcsResult<()> {
        let action = format!("create tag for project {project}");
        let branch = self.branch_of(project, &action)?;
        let body = json!({
            "tag_name": tag,
            "ref": branch,
            "message": format!("Tagged by {COMMITTER_SIGNATURE} for {}\n", tagger.mail),
        });
        let url = self.project_url(project, "repository/tags")?;
        let resp = self.api.call("POST", &url, Some(&body), None, &action)?;
        self.api.expect(resp, &[201], &action)?;
        tracing::info!(group = %self.api.owner, project, tag, "created tag");
        Ok(())
    }

    fn delete_tag(&self, project: &str, tag: &str) -> VcsResult<()> {
        let action = format!("delete tag {tag}");
        let url = self.project_url(
            project,
            &format!("repository/tags/{}", percent_encode(tag, true)),
        )?;
        let resp = self.api.call("DELETE", &url, None, None, &action)?;
        self.api.expect(resp, &[200, 204], &action)?;
        tracing::info!(group = %self.api.owner, project, tag, "deleted tag");
        Ok(())
    }
}
