//! Property-based tests for the LID/PN mapping store.
//!
//! The mapping layer sits under every addressing decision the client makes,
//! so its invariants are checked for arbitrary users and devices rather than
//! hand-picked examples:
//!
//! 1. **Round-trip**: a stored pair resolves in both directions
//! 2. **Device semantics**: devices come from the query, not the store
//! 3. **Durability**: answers survive a cold cache
//! 4. **Batch consistency**: batch lookups agree with single lookups

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::sync::Arc;

use conclave_core::env::test_utils::MockEnv;
use conclave_core::mapping::{MappingPair, MappingStore};
use conclave_core::store::MemoryStore;
use conclave_proto::{Jid, Server};
use proptest::prelude::*;

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime should build")
        .block_on(future)
}

/// PN users are digit strings; LID users are longer alphanumerics.
fn arbitrary_users() -> impl Strategy<Value = Vec<(String, String)>> {
    (
        prop::collection::btree_set("[0-9]{6,14}", 1..6),
        prop::collection::btree_set("[a-z0-9]{10,18}", 1..6),
    )
        .prop_map(|(pns, lids): (BTreeSet<String>, BTreeSet<String>)| {
            pns.into_iter().zip(lids).collect()
        })
}

fn pairs_for(users: &[(String, String)]) -> Vec<MappingPair> {
    users
        .iter()
        .map(|(pn_user, lid_user)| MappingPair {
            lid: Jid::new(lid_user.clone(), Server::Lid),
            pn: Jid::new(pn_user.clone(), Server::Pn),
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_stored_pairs_resolve_in_both_directions(
        users in arbitrary_users(),
        device in any::<u16>(),
    ) {
        block_on(async {
            let env = MockEnv::new();
            let store = MappingStore::new(env, Arc::new(MemoryStore::new()));
            store.store_mappings(&pairs_for(&users)).await;

            for (pn_user, lid_user) in &users {
                let pn = Jid::new(pn_user.clone(), Server::Pn).with_device(device);
                let lid = store.lid_for_pn(&pn).await.unwrap().unwrap();
                prop_assert_eq!(&lid.user, lid_user);

                let back = store.pn_for_lid(&lid).await.unwrap().unwrap();
                prop_assert_eq!(&back.user, pn_user);
            }
            Ok(())
        })?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_devices_come_from_the_query(
        users in arbitrary_users(),
        device in 1u16..100,
    ) {
        block_on(async {
            let env = MockEnv::new();
            let store = MappingStore::new(env, Arc::new(MemoryStore::new()));
            store.store_mappings(&pairs_for(&users)).await;

            for (pn_user, lid_user) in &users {
                // Nonzero PN devices carry over; device zero renders
                // deviceless on the LID side.
                let with = store
                    .lid_for_pn(&Jid::new(pn_user.clone(), Server::Pn).with_device(device))
                    .await
                    .unwrap()
                    .unwrap();
                prop_assert_eq!(with.device, Some(device));

                let without =
                    store.lid_for_pn(&Jid::new(pn_user.clone(), Server::Pn)).await.unwrap().unwrap();
                prop_assert_eq!(without.device, None);

                // The PN side always carries an explicit device.
                let zero = store
                    .pn_for_lid(&Jid::new(lid_user.clone(), Server::Lid))
                    .await
                    .unwrap()
                    .unwrap();
                prop_assert_eq!(zero.device, Some(0));
            }
            Ok(())
        })?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_answers_survive_a_cold_cache(users in arbitrary_users()) {
        block_on(async {
            let env = MockEnv::new();
            let backing = Arc::new(MemoryStore::new());

            let warm = MappingStore::new(env.clone(), Arc::clone(&backing));
            warm.store_mappings(&pairs_for(&users)).await;

            // A fresh store over the same records has an empty cache, so
            // every answer below comes from persistence alone.
            let cold = MappingStore::new(env, backing);
            for (pn_user, lid_user) in &users {
                let pn = Jid::new(pn_user.clone(), Server::Pn);
                prop_assert_eq!(
                    cold.lid_for_pn(&pn).await.unwrap().map(|jid| jid.user),
                    Some(lid_user.clone())
                );
                let lid = Jid::new(lid_user.clone(), Server::Lid);
                prop_assert_eq!(
                    cold.pn_for_lid(&lid).await.unwrap().map(|jid| jid.user),
                    Some(pn_user.clone())
                );
            }
            Ok(())
        })?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_batch_lookup_agrees_with_single_lookups(
        users in arbitrary_users(),
        unknown in "[0-9]{15}",
    ) {
        block_on(async {
            let env = MockEnv::new();
            let store = MappingStore::new(env, Arc::new(MemoryStore::new()));
            store.store_mappings(&pairs_for(&users)).await;

            let mut query: Vec<Jid> =
                users.iter().map(|(pn_user, _)| Jid::new(pn_user.clone(), Server::Pn)).collect();
            query.push(Jid::new(unknown.clone(), Server::Pn));

            let batch = store.lids_for_pns(&query).await.unwrap();

            // The unknown user is absent, not an error.
            prop_assert_eq!(batch.len(), users.len());
            for pn in &query[..users.len()] {
                let single = store.lid_for_pn(pn).await.unwrap();
                let from_batch =
                    batch.iter().find(|pair| pair.pn.same_user(pn)).map(|pair| pair.lid.clone());
                prop_assert_eq!(from_batch, single);
            }
            Ok(())
        })?;
    }
}
