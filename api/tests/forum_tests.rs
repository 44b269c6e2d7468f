//! Forum behaviour against a real SQLite database: slugs, counters,
//! likes, mentions, notifications and the delete rules.

mod common;

use common::{admin, count, notifications_of, user, TestDb, GENERAL};
use scholia_api::error::ApiError;
use scholia_api::forum::subscriptions::Membership;
use scholia_api::forum::threads::ThreadListParams;
use scholia_api::forum::{
    categories, likes, load_thread, notifications, posts, subscriptions, threads,
};
use scholia_shared::{
    CreateCategory, CreatePost, CreateThread, NotificationKind, UpdateCategory, UpdateThread,
};

fn new_thread(category_id: i64, title: &str, content: &str) -> CreateThread {
    CreateThread {
        category_id,
        title: title.to_string(),
        content: content.to_string(),
    }
}

fn reply(content: &str) -> CreatePost {
    CreatePost {
        content: content.to_string(),
    }
}

#[test]
fn test_thread_slugs_get_numeric_suffixes() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");

    let slugs: Vec<String> = (0..3)
        .map(|_| {
            threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Hello World", "body"))
                .unwrap()
                .thread
                .slug
        })
        .collect();

    assert_eq!(slugs, ["hello-world", "hello-world-1", "hello-world-2"]);
}

#[test]
fn test_failed_mention_notification_rolls_back_post() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");
    let bob = user(&conn, "bob");

    let created =
        threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Atomic", "first")).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER fail_mentions BEFORE INSERT ON notifications
         WHEN NEW.type = 'mention'
         BEGIN SELECT RAISE(ABORT, 'mention notifications unavailable'); END;",
    )
    .unwrap();

    let err = posts::create_post(&mut conn, &bob, created.thread.id, &reply("ping @alice"))
        .unwrap_err();
    assert!(matches!(err, ApiError::Internal(_)));

    let thread_id = created.thread.id;
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM posts WHERE thread_id = ?1", [thread_id]), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM post_mentions", []), 0);
    assert_eq!(load_thread(&conn, thread_id).unwrap().post_count, 1);
    assert_eq!(
        count(&conn, "SELECT forum_post_count FROM users WHERE id = ?1", [bob.id]),
        0
    );
}

#[test]
fn test_like_is_idempotent() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");
    let bob = user(&conn, "bob");

    let created =
        threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Likeable", "nice post"))
            .unwrap();
    let post_id = created.post.id;

    let first = likes::like_post(&mut conn, &bob, post_id).unwrap();
    let second = likes::like_post(&mut conn, &bob, post_id).unwrap();

    assert_eq!(first.like_count, 1);
    assert_eq!(second.like_count, 1);
    assert!(second.liked);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM post_likes WHERE post_id = ?1", [post_id]), 1);
    assert_eq!(notifications_of(&conn, alice.id, "like"), 1);
    assert_eq!(
        count(&conn, "SELECT forum_reputation FROM users WHERE id = ?1", [alice.id]),
        1
    );

    let after = likes::unlike_post(&mut conn, &bob, post_id).unwrap();
    assert_eq!(after.like_count, 0);
    assert_eq!(
        count(&conn, "SELECT forum_reputation FROM users WHERE id = ?1", [alice.id]),
        0
    );
    assert!(matches!(
        likes::unlike_post(&mut conn, &bob, post_id),
        Err(ApiError::NotFound(_))
    ));
}

#[test]
fn test_self_like_and_self_mention_do_not_notify() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");

    let created = threads::create_thread(
        &mut conn,
        &alice,
        &new_thread(GENERAL, "Talking to myself", "note to @alice"),
    )
    .unwrap();
    likes::like_post(&mut conn, &alice, created.post.id).unwrap();

    assert_eq!(count(&conn, "SELECT COUNT(*) FROM notifications WHERE user_id = ?1", [alice.id]), 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM post_mentions", []), 0);
    assert_eq!(
        count(&conn, "SELECT forum_reputation FROM users WHERE id = ?1", [alice.id]),
        0
    );
}

#[test]
fn test_repeated_mention_notifies_once() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");
    let bob = user(&conn, "bob");

    threads::create_thread(
        &mut conn,
        &alice,
        &new_thread(GENERAL, "Twice", "@bob and again @Bob, also @bob@example.com"),
    )
    .unwrap();

    assert_eq!(notifications_of(&conn, bob.id, "mention"), 1);
}

#[test]
fn test_counters_after_deletes() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");

    let created =
        threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Counting", "post 0"))
            .unwrap();
    let thread_id = created.thread.id;
    let replies: Vec<i64> = (1..5)
        .map(|i| {
            posts::create_post(&mut conn, &alice, thread_id, &reply(&format!("post {i}")))
                .unwrap()
                .id
        })
        .collect();

    posts::delete_post(&mut conn, &alice, replies[0]).unwrap();
    posts::delete_post(&mut conn, &alice, replies[3]).unwrap();

    let direct = count(&conn, "SELECT COUNT(*) FROM posts WHERE thread_id = ?1", [thread_id]);
    assert_eq!(direct, 3);
    assert_eq!(load_thread(&conn, thread_id).unwrap().post_count, direct);
    assert_eq!(
        count(&conn, "SELECT forum_post_count FROM users WHERE id = ?1", [alice.id]),
        direct
    );

    let last = posts::list_posts(&conn, thread_id, None, None).unwrap();
    let newest = last.items.last().unwrap();
    assert_eq!(load_thread(&conn, thread_id).unwrap().last_post_at, newest.created_at);
}

#[test]
fn test_opening_post_cannot_be_deleted() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");

    let created =
        threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Keep me", "opener"))
            .unwrap();
    assert!(matches!(
        posts::delete_post(&mut conn, &alice, created.post.id),
        Err(ApiError::Validation(_))
    ));
}

#[test]
fn test_category_delete_guard_and_thread_cascade() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let root = admin(&conn, "root");
    let alice = user(&conn, "alice");
    let bob = user(&conn, "bob");

    let parent = categories::create_category(
        &conn,
        &root,
        &CreateCategory {
            name: "Parent".into(),
            ..Default::default()
        },
    )
    .unwrap();
    let child = categories::create_category(
        &conn,
        &root,
        &CreateCategory {
            name: "Child".into(),
            parent_id: Some(parent.id),
            ..Default::default()
        },
    )
    .unwrap();

    assert!(matches!(
        categories::delete_category(&conn, &root, parent.id),
        Err(ApiError::Conflict(_))
    ));

    let created =
        threads::create_thread(&mut conn, &alice, &new_thread(child.id, "Doomed", "first"))
            .unwrap();
    let thread_id = created.thread.id;
    posts::create_post(&mut conn, &bob, thread_id, &reply("second")).unwrap();
    posts::create_post(&mut conn, &alice, thread_id, &reply("third")).unwrap();
    likes::like_post(&mut conn, &bob, created.post.id).unwrap();

    assert!(matches!(
        categories::delete_category(&conn, &root, child.id),
        Err(ApiError::Conflict(_))
    ));
    assert!(matches!(
        threads::delete_thread(&mut conn, &bob, thread_id),
        Err(ApiError::Forbidden(_))
    ));

    threads::delete_thread(&mut conn, &root, thread_id).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM posts WHERE thread_id = ?1", [thread_id]), 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM post_likes", []), 0);
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM notifications WHERE thread_id = ?1", [thread_id]),
        0
    );
    assert_eq!(
        count(&conn, "SELECT forum_post_count FROM users WHERE id = ?1", [alice.id]),
        0
    );

    categories::delete_category(&conn, &root, child.id).unwrap();
    categories::delete_category(&conn, &root, parent.id).unwrap();
}

#[test]
fn test_locked_thread_and_banned_user() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let root = admin(&conn, "root");
    let alice = user(&conn, "alice");
    let bob = user(&conn, "bob");

    let created =
        threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Locked", "first"))
            .unwrap();
    let thread_id = created.thread.id;

    let lock = UpdateThread {
        is_locked: Some(true),
        ..Default::default()
    };
    assert!(matches!(
        threads::update_thread(&conn, &alice, thread_id, &lock),
        Err(ApiError::Forbidden(_))
    ));
    threads::update_thread(&conn, &root, thread_id, &lock).unwrap();

    assert!(matches!(
        posts::create_post(&mut conn, &bob, thread_id, &reply("let me in")),
        Err(ApiError::Forbidden(_))
    ));
    posts::create_post(&mut conn, &root, thread_id, &reply("moderator note")).unwrap();

    scholia_api::users::set_ban(&conn, bob.id, true, None).unwrap();
    assert!(matches!(
        threads::create_thread(&mut conn, &bob, &new_thread(GENERAL, "Banned", "hi")),
        Err(ApiError::Forbidden(_))
    ));
}

#[test]
fn test_sticky_threads_list_first() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let root = admin(&conn, "root");
    let alice = user(&conn, "alice");

    let pinned =
        threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Rules", "read me"))
            .unwrap();
    threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Newer", "chatter")).unwrap();
    threads::update_thread(
        &conn,
        &root,
        pinned.thread.id,
        &UpdateThread {
            is_sticky: Some(true),
            ..Default::default()
        },
    )
    .unwrap();

    let listed = threads::list_threads(&conn, None, &threads::ThreadListParams::default()).unwrap();
    assert_eq!(listed.pagination.total, 2);
    assert_eq!(listed.items[0].id, pinned.thread.id);

    let sticky_only = threads::list_threads(
        &conn,
        None,
        &threads::ThreadListParams {
            sticky: Some(true),
            category: Some("general".into()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(sticky_only.items.len(), 1);
}

/// General (posting requires registration) → A opens "Hello" mentioning
/// B → B replies while A and C are subscribed.
#[test]
fn test_end_to_end_thread_lifecycle() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let a = user(&conn, "alice");
    let b = user(&conn, "bob");
    let c = user(&conn, "carol");

    let created =
        threads::create_thread(&mut conn, &a, &new_thread(GENERAL, "Hello", "Hi @bob")).unwrap();
    let thread_id = created.thread.id;

    assert_eq!(created.thread.post_count, 1);
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM post_mentions WHERE post_id = ?1 AND mentioned_user_id = ?2",
            [created.post.id, b.id],
        ),
        1
    );
    assert_eq!(notifications_of(&conn, b.id, "mention"), 1);
    assert_eq!(notifications_of(&conn, a.id, "reply"), 0);

    for who in [&a, &b, &c] {
        subscriptions::add(&conn, who, thread_id, subscriptions::Membership::Subscription).unwrap();
    }

    let before = load_thread(&conn, thread_id).unwrap().last_post_at;
    let answer = posts::create_post(&mut conn, &b, thread_id, &reply("Hi yourself")).unwrap();
    let thread = load_thread(&conn, thread_id).unwrap();

    assert_eq!(thread.post_count, 2);
    assert_eq!(thread.last_post_at, answer.created_at);
    assert!(thread.last_post_at >= before);
    assert_eq!(
        count(&conn, "SELECT forum_post_count FROM users WHERE id = ?1", [b.id]),
        1
    );
    assert_eq!(notifications_of(&conn, a.id, "reply"), 1);
    assert_eq!(notifications_of(&conn, c.id, "reply"), 1);
    assert_eq!(notifications_of(&conn, b.id, "reply"), 0);
}

#[test]
fn test_category_slugs_get_numeric_suffixes() {
    let db = TestDb::new();
    let conn = db.conn();
    let root = admin(&conn, "root");

    let slugs: Vec<String> = (0..3)
        .map(|_| {
            categories::create_category(
                &conn,
                &root,
                &CreateCategory {
                    name: "Rust".into(),
                    ..Default::default()
                },
            )
            .unwrap()
            .slug
        })
        .collect();

    assert_eq!(slugs, ["rust", "rust-1", "rust-2"]);
}

#[test]
fn test_category_cannot_be_its_own_parent() {
    let db = TestDb::new();
    let conn = db.conn();
    let root = admin(&conn, "root");
    let category = categories::create_category(
        &conn,
        &root,
        &CreateCategory {
            name: "Loop".into(),
            ..Default::default()
        },
    )
    .unwrap();

    assert!(matches!(
        categories::update_category(
            &conn,
            &root,
            category.id,
            &UpdateCategory {
                parent_id: Some(category.id),
                ..Default::default()
            },
        ),
        Err(ApiError::Validation(_))
    ));
    assert_eq!(categories::get_category(&conn, category.id).unwrap().parent_id, None);
}

#[test]
fn test_views_skip_the_author() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");
    let bob = user(&conn, "bob");

    let created =
        threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Watched", "body"))
            .unwrap();
    let id = created.thread.id;

    threads::thread_detail(&conn, Some(&alice), id, None, None).unwrap();
    assert_eq!(load_thread(&conn, id).unwrap().views, 0);

    threads::thread_detail(&conn, None, id, None, None).unwrap();
    threads::thread_detail(&conn, None, id, None, None).unwrap();
    assert_eq!(load_thread(&conn, id).unwrap().views, 2);

    let seen = threads::thread_detail(&conn, Some(&bob), id, None, None).unwrap();
    assert_eq!(seen.thread.views, 3);
}

#[test]
fn test_thread_detail_reports_memberships() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");
    let bob = user(&conn, "bob");

    let created =
        threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Follow me", "body"))
            .unwrap();
    let id = created.thread.id;

    subscriptions::add(&conn, &bob, id, Membership::Subscription).unwrap();
    let detail = threads::thread_detail(&conn, Some(&bob), id, None, None).unwrap();
    assert!(detail.subscribed);
    assert!(!detail.bookmarked);

    subscriptions::add(&conn, &bob, id, Membership::Bookmark).unwrap();
    subscriptions::remove(&conn, &bob, id, Membership::Subscription).unwrap();
    let detail = threads::thread_detail(&conn, Some(&bob), id, None, None).unwrap();
    assert!(!detail.subscribed);
    assert!(detail.bookmarked);

    let anonymous = threads::thread_detail(&conn, None, id, None, None).unwrap();
    assert!(!anonymous.subscribed && !anonymous.bookmarked);
    let author = threads::thread_detail(&conn, Some(&alice), id, None, None).unwrap();
    assert!(!author.subscribed && !author.bookmarked);
}

#[test]
fn test_notify_never_reaches_the_actor() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");
    let bob = user(&conn, "bob");
    let created =
        threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Quiet", "body")).unwrap();
    let (post_id, thread_id) = (created.post.id, created.thread.id);

    let reply_to_alice = |actor: i64| {
        notifications::notify(
            &*conn,
            actor,
            alice.id,
            NotificationKind::Reply,
            post_id,
            Some(thread_id),
            "replied",
        )
    };

    reply_to_alice(alice.id).unwrap();
    assert_eq!(notifications_of(&conn, alice.id, "reply"), 0);

    reply_to_alice(bob.id).unwrap();
    assert_eq!(notifications_of(&conn, alice.id, "reply"), 1);
}

#[test]
fn test_far_page_lists_nothing() {
    let db = TestDb::new();
    let mut conn = db.conn();
    let alice = user(&conn, "alice");
    threads::create_thread(&mut conn, &alice, &new_thread(GENERAL, "Only one", "body")).unwrap();

    let listed = threads::list_threads(
        &conn,
        None,
        &ThreadListParams {
            page: Some(i64::MAX),
            limit: Some(100),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(listed.items.is_empty());
    assert_eq!(listed.pagination.total, 1);
}
