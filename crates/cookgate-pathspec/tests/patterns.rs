use cookgate_pathspec::{is_ignored, Grammar, IgnoreFile};

fn assert_paths(grammar: Grammar, content: &str, include: &[&str], ignore: &[&str]) {
    let file = IgnoreFile::parse(grammar, content).expect("parse ignore file");
    for path in include {
        assert!(
            !file.is_ignored(path),
            "{} ({:?}) ignored {path:?}, want included",
            grammar.as_str(),
            content.replace('\n', ", ")
        );
    }
    for path in ignore {
        assert!(
            file.is_ignored(path),
            "{} ({:?}) included {path:?}, want ignored",
            grammar.as_str(),
            content.replace('\n', ", ")
        );
    }
}

#[test]
fn gitignore_grammar() {
    let content = ".#*\n\\#*#\n.*.sw[a-z]\n**/foobar/foobar.txt\n/foo.txt\ntest/\nfoo/**/bar\n/b[^a]r/foo";
    assert_paths(
        Grammar::GitIgnore,
        content,
        &[
            "!.#test",
            "~foo",
            "foo/foo.txt",
            "bar/foobar.txt",
            "foo/bar.txt",
            "/bar/foo",
            "bar/foo",
        ],
        &[
            ".#test",
            "foo/#test#",
            "foo/bar/.foo.txt.swp",
            "foo/foobar/foobar.txt",
            "foo.txt",
            "test/foo.test",
            "test/foo/bar.test",
            "foo/bar",
            "foo/1/2/bar",
            "bur/foo",
        ],
    );
}

#[test]
fn chefignore_grammar() {
    let content = "*~\n*.sw[a-z]\n*.b?k\ntest*\n*_flymake.*\nfoo/b[^a]r";
    assert_paths(
        Grammar::ChefIgnore,
        content,
        &["foo", "~foo", "foo.txt", "foo/bar.txt", "foo/bar"],
        &[
            "foo~",
            "foo/bar.txt~",
            "foo/bar/foo.txt.swp",
            "foo.txt.bak",
            "test/foo.test",
            "test/foo/bar.test",
            "foo/bar_flymake.el",
        ],
    );
}

#[test]
fn negation_is_order_sensitive_in_both_grammars() {
    for grammar in [Grammar::GitIgnore, Grammar::ChefIgnore] {
        let reinclude = "*.rb\n!recipes/default.rb\n";
        assert!(!is_ignored(grammar, reinclude, "recipes/default.rb").unwrap());
        assert!(is_ignored(grammar, reinclude, "recipes/other.rb").unwrap());

        let reexclude = "*.rb\n!recipes/default.rb\nrecipes/*\n";
        assert!(is_ignored(grammar, reexclude, "recipes/default.rb").unwrap());
    }
}

#[test]
fn malformed_patterns_fail_instead_of_matching_nothing() {
    assert!(is_ignored(Grammar::GitIgnore, "files/[abc", "files/a").is_err());
    assert!(is_ignored(Grammar::ChefIgnore, "files/[abc", "files/a").is_err());
    assert!(is_ignored(Grammar::GitIgnore, "a***b", "ab").is_err());
}

#[test]
fn no_patterns_means_nothing_ignored() {
    assert!(!is_ignored(Grammar::GitIgnore, "", "recipes/default.rb").unwrap());
    assert!(!IgnoreFile::empty().is_ignored("x"));
}
