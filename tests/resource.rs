// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
mod common;

use bytes::Bytes;
use http::StatusCode;

use dfs_webdav::acl::Privilege;
use dfs_webdav::api::{ApiError, FsApi, FsPermission};
use dfs_webdav::locks::{LockInfo, LockScope, LockType};
use dfs_webdav::props::{
    DavProperty, PropertyChange, PropertyName, PropertyValue, CURRENT_USER_PRIVILEGE_SET,
    DISPLAYNAME, GETCONTENTLENGTH, ISCOLLECTION, OWNER, RESOURCETYPE,
};
use dfs_webdav::{DavError, InputContext};

use common::{collection_request, resource, session, setup, Fault};

#[tokio::test]
async fn exists_follows_backend_and_never_hides_errors() {
    let (factory, api, mem) = setup();
    let s = session("alice", &[]);
    mem.create_new_file("/present").await.unwrap();

    assert!(resource(&factory, &s, "/present").exists().await.unwrap());
    assert!(!resource(&factory, &s, "/absent").exists().await.unwrap());

    api.inject(Fault::Exists);
    assert!(matches!(
        resource(&factory, &s, "/present").exists().await,
        Err(DavError::Fatal(_))
    ));
}

#[tokio::test]
async fn is_collection_matches_directory_flag() {
    let (factory, api, mem) = setup();
    let s = session("alice", &[]);
    mem.mkdirs("/dir").await.unwrap();
    mem.create_new_file("/file").await.unwrap();

    assert!(resource(&factory, &s, "/dir").is_collection().await);
    assert!(!resource(&factory, &s, "/file").is_collection().await);
    assert!(!resource(&factory, &s, "/nowhere").is_collection().await);

    api.inject(Fault::Stat);
    assert!(!resource(&factory, &s, "/dir").is_collection().await);
}

#[tokio::test]
async fn empty_creation_and_zero_length_payload_take_different_paths() {
    let (factory, api, mem) = setup();
    let s = session("alice", &[]);
    let root = resource(&factory, &s, "/");

    root.add_member(&resource(&factory, &s, "/a"), InputContext::empty())
        .await
        .unwrap();
    assert_eq!(api.calls().last().map(String::as_str), Some("create_new_file /a"));

    api.clear_calls();
    root.add_member(&resource(&factory, &s, "/b"), InputContext::from_bytes(Bytes::new()))
        .await
        .unwrap();
    assert_eq!(api.calls(), vec!["create /b".to_string()]);

    assert_eq!(mem.stat("/a").await.unwrap().len, 0);
    assert_eq!(mem.stat("/b").await.unwrap().len, 0);
}

#[tokio::test]
async fn payload_overwrites_content() {
    let (factory, _api, mem) = setup();
    let s = session("alice", &[]);
    let root = resource(&factory, &s, "/");
    let member = resource(&factory, &s, "/doc.txt");

    root.add_member(&member, InputContext::from_bytes(Bytes::from_static(b"first draft")))
        .await
        .unwrap();
    root.add_member(&member, InputContext::from_bytes(Bytes::from_static(b"final")))
        .await
        .unwrap();
    assert_eq!(mem.stat("/doc.txt").await.unwrap().len, 5);

    let mut out = Vec::new();
    assert_eq!(member.spool(&mut out).await.unwrap(), 5);
    assert_eq!(out, b"final");
}

#[tokio::test]
async fn refused_creation_is_a_conflict() {
    let (factory, api, mem) = setup();
    let s = session("alice", &[]);
    let root = resource(&factory, &s, "/");
    mem.create_new_file("/taken").await.unwrap();

    assert!(matches!(
        root.add_member(&resource(&factory, &s, "/taken"), InputContext::empty()).await,
        Err(DavError::Conflict(_))
    ));

    api.inject(Fault::CreateNewFileRefused);
    assert!(matches!(
        root.add_member(&resource(&factory, &s, "/fresh"), InputContext::empty()).await,
        Err(DavError::Conflict(_))
    ));
}

#[tokio::test]
async fn collection_requests_make_directories() {
    let (factory, api, mem) = setup();
    let s = session("alice", &[]);
    let root = resource(&factory, &s, "/");

    let dir = collection_request(&factory, &s, "/photos");
    assert!(dir.is_collection_request());
    root.add_member(&dir, InputContext::empty()).await.unwrap();
    assert!(mem.stat("/photos").await.unwrap().is_dir);

    // Already there: still fine.
    root.add_member(&dir, InputContext::empty()).await.unwrap();

    api.inject(Fault::MkdirsRefused);
    assert!(matches!(
        root.add_member(&collection_request(&factory, &s, "/music"), InputContext::empty())
            .await,
        Err(DavError::Conflict(_))
    ));
}

#[tokio::test]
async fn shallow_copy_of_collection_is_forbidden() {
    let (factory, api, mem) = setup();
    let s = session("alice", &[]);
    mem.create_new_file("/src/inner").await.unwrap();
    let source = resource(&factory, &s, "/src");
    let dest = resource(&factory, &s, "/dst");

    api.clear_calls();
    assert!(matches!(source.copy(&dest, true).await, Err(DavError::Forbidden(_))));
    assert!(!api.calls().iter().any(|c| c.starts_with("copy")));
    assert!(!mem.exists("/dst").await.unwrap());

    source.copy(&dest, false).await.unwrap();
    assert!(mem.exists("/dst/inner").await.unwrap());

    assert!(matches!(
        resource(&factory, &s, "/missing").copy(&dest, false).await,
        Err(DavError::NotFound)
    ));
}

#[tokio::test]
async fn delete_that_removes_nothing_is_not_found() {
    let (factory, api, mem) = setup();
    let s = session("alice", &[]);
    let root = resource(&factory, &s, "/");
    mem.create_new_file("/victim").await.unwrap();

    assert!(matches!(
        root.remove_member(&resource(&factory, &s, "/ghost")).await,
        Err(DavError::NotFound)
    ));

    api.inject(Fault::NotRemoved);
    assert!(matches!(
        root.remove_member(&resource(&factory, &s, "/victim")).await,
        Err(DavError::NotFound)
    ));
    assert!(mem.exists("/victim").await.unwrap());

    api.heal();
    root.remove_member(&resource(&factory, &s, "/victim")).await.unwrap();
    assert!(!mem.exists("/victim").await.unwrap());
}

#[tokio::test]
async fn privileges_use_exactly_one_tier() {
    let (factory, _api, mem) = setup();
    mem.create_new_file("/report").await.unwrap();
    mem.set_owner("/report", "alice", "staff").unwrap();
    mem.set_permission("/report", FsPermission::from_mode(0o640)).unwrap();

    let cases = [
        (session("alice", &["staff"]), vec![Privilege::Read, Privilege::Write]),
        (session("bob", &["staff"]), vec![Privilege::Read]),
        (session("carol", &["others"]), vec![]),
    ];
    for (s, expected) in cases {
        let mut node = resource(&factory, &s, "/report");
        let prop = node
            .property(&PropertyName::dav(CURRENT_USER_PRIVILEGE_SET))
            .await
            .cloned()
            .unwrap();
        assert_eq!(prop.value, PropertyValue::Privileges(expected), "{:?}", s);
    }
}

#[tokio::test]
async fn listing_skips_only_unresolvable_children() {
    let (factory, _api, mem) = setup();
    let s = session("alice", &[]);
    mem.create_new_file("/dir/a").await.unwrap();
    mem.create_new_file("/dir/bad\0name").await.unwrap();
    mem.create_new_file("/dir/z").await.unwrap();

    let members = resource(&factory, &s, "/dir").members().await.unwrap();
    assert_eq!(members.len(), 3);
    let resolved: Vec<String> = members
        .iter()
        .filter_map(|m| m.as_ref().ok())
        .map(|m| m.path().to_string())
        .collect();
    assert_eq!(resolved, vec!["/dir/a", "/dir/z"]);
    assert_eq!(members.iter().filter(|m| m.is_err()).count(), 1);
}

#[tokio::test]
async fn listing_failure_is_fatal() {
    let (factory, api, mem) = setup();
    let s = session("alice", &[]);
    mem.mkdirs("/dir").await.unwrap();
    api.inject(Fault::Ls);
    assert!(matches!(
        resource(&factory, &s, "/dir").members().await,
        Err(DavError::Fatal(ApiError::Backend(_)))
    ));
}

#[test]
fn href_and_parent() {
    let (factory, _api, _mem) = setup();
    let s = session("alice", &[]);
    assert_eq!(resource(&factory, &s, "").href(), "/");
    assert_eq!(resource(&factory, &s, "/").href(), "/");
    assert_eq!(resource(&factory, &s, "/a/b").href(), "/a/b");
    assert_eq!(resource(&factory, &s, "/a%20b/c/").href(), "/a b/c");

    assert!(resource(&factory, &s, "/").collection().unwrap().is_none());
    let parent = resource(&factory, &s, "/a/b").collection().unwrap().unwrap();
    assert_eq!(parent.path(), "/a");
}

#[tokio::test]
async fn properties_are_loaded_once() {
    let (factory, api, mem) = setup();
    let s = session("alice", &[]);
    mem.create_new_file("/f").await.unwrap();
    let mut node = resource(&factory, &s, "/f");

    api.clear_calls();
    let names = node.property_names().await;
    assert_eq!(names.len(), 8);
    node.properties().await;
    node.property(&PropertyName::dav(OWNER)).await;
    assert_eq!(api.calls(), vec!["stat /f".to_string()]);

    let length = node.property(&PropertyName::dav(GETCONTENTLENGTH)).await.unwrap();
    assert_eq!(length.value, PropertyValue::Text("0".to_string()));
}

#[tokio::test]
async fn metadata_failure_leaves_naming_properties() {
    let (factory, api, mem) = setup();
    let s = session("alice", &[]);
    mem.mkdirs("/d").await.unwrap();
    api.inject(Fault::Stat);

    let mut node = resource(&factory, &s, "/d");
    let names = node.property_names().await;
    assert_eq!(
        names,
        vec![
            PropertyName::dav(DISPLAYNAME),
            PropertyName::dav(ISCOLLECTION),
            PropertyName::dav(RESOURCETYPE),
        ]
    );
    let kind = node.property(&PropertyName::dav(RESOURCETYPE)).await.unwrap();
    assert_eq!(kind.value, PropertyValue::ResourceType { collection: false });
}

#[tokio::test]
async fn property_updates_are_not_persisted() {
    let (factory, _api, mem) = setup();
    let s = session("alice", &[]);
    mem.create_new_file("/f").await.unwrap();
    let mut node = resource(&factory, &s, "/f");

    let color = PropertyName::new("urn:example", "color");
    let res = node
        .alter_properties(vec![
            PropertyChange::Set(DavProperty {
                name: color.clone(),
                value: PropertyValue::Text("red".to_string()),
            }),
            PropertyChange::Remove(PropertyName::dav(OWNER)),
        ])
        .await;
    assert_eq!(
        res,
        vec![
            (color.clone(), StatusCode::FORBIDDEN),
            (PropertyName::dav(OWNER), StatusCode::FORBIDDEN),
        ]
    );
    assert!(node.property(&color).await.is_none());

    let fresh_names = resource(&factory, &s, "/f").property_names().await;
    assert!(fresh_names.contains(&PropertyName::dav(OWNER)));
}

#[tokio::test]
async fn lock_grants_are_visible() {
    let (factory, _api, mem) = setup();
    let s = session("alice", &[]);
    mem.create_new_file("/f").await.unwrap();
    let node = resource(&factory, &s, "/f");

    assert!(node.is_lockable(LockType::Write, LockScope::Exclusive));
    assert!(!node.has_lock(LockType::Write, LockScope::Exclusive));

    let lock = node.lock(&LockInfo::exclusive_write()).unwrap();
    assert_eq!(lock.principal.as_deref(), Some("alice"));
    assert!(node.has_lock(LockType::Write, LockScope::Exclusive));
    assert_eq!(
        resource(&factory, &session("bob", &[]), "/f").locks(),
        vec![lock.clone()]
    );

    node.refresh_lock(&LockInfo::exclusive_write(), &lock.token).unwrap();
    node.unlock(&lock.token).unwrap();
    assert!(node.lock_of(LockType::Write, LockScope::Exclusive).is_none());
    assert!(matches!(node.unlock(&lock.token), Err(DavError::PreconditionFailed(_))));
}

#[tokio::test]
async fn removal_drops_locks_below() {
    let (factory, _api, mem) = setup();
    let s = session("alice", &[]);
    mem.create_new_file("/d/f").await.unwrap();
    let file = resource(&factory, &s, "/d/f");
    file.lock(&LockInfo::exclusive_write()).unwrap();

    resource(&factory, &s, "/")
        .remove_member(&resource(&factory, &s, "/d"))
        .await
        .unwrap();
    assert!(file.locks().is_empty());
}

#[tokio::test]
async fn move_and_spool() {
    let (factory, _api, mem) = setup();
    let s = session("alice", &[]);
    let root = resource(&factory, &s, "/");
    let from = resource(&factory, &s, "/old.txt");
    root.add_member(&from, InputContext::from_bytes(Bytes::from_static(b"payload")))
        .await
        .unwrap();

    let to = resource(&factory, &s, "/new.txt");
    from.move_to(&to).await.unwrap();
    assert!(!mem.exists("/old.txt").await.unwrap());

    let mut out = Vec::new();
    to.spool(&mut out).await.unwrap();
    assert_eq!(out, b"payload");

    let mut nothing = Vec::new();
    assert_eq!(root.spool(&mut nothing).await.unwrap(), 0);
    assert!(nothing.is_empty());

    assert!(matches!(
        resource(&factory, &s, "/gone").move_to(&to).await,
        Err(DavError::Internal(ApiError::NotFound(_)))
    ));
}

#[test]
fn compliance() {
    let (factory, _api, _mem) = setup();
    let node = resource(&factory, &session("alice", &[]), "/");
    assert_eq!(node.compliance_class(), "2");
    assert!(!node.supported_methods().contains("PROPPATCH"));
    assert_eq!(node.display_name(), "");
}
