//! Turning client queries into responses: question validation, EDNS
//! handling, the CNAME chain walk, and assembly of the answer,
//! authority, and additional sections.

use std::collections::HashSet;

use dns_cache::entry::{Cent, DF_AUTH, DF_LOCAL};
use dns_cache::unix_now;
use dns_resolver::{resolve, ResolverContext, CNAME_HOP_LIMIT};
use dns_types::protocol::edns::{
    append_opt, split_extended_rcode, strip_opt, EdnsInfo, EXTENDED_RCODE_BADVERS,
    MIN_UDP_PAYLOAD_SIZE,
};
use dns_types::protocol::types::*;

use crate::AppState;

/// Maximum recursion depth inside a single resolution (the resolver's
/// question stack).
pub const RECURSION_LIMIT: usize = 32;

/// Handle one decoded client message.  Returns the response (if one
/// should be sent at all) and the UDP size budget the client
/// advertised.
pub async fn handle_message(state: &AppState, query: Message) -> Option<(Message, usize)> {
    let mut query = query;
    let mut udp_budget = MIN_UDP_PAYLOAD_SIZE as usize;

    if query.header.is_response {
        return Some((
            Message::make_format_error_response(query.header.id),
            udp_budget,
        ));
    }

    let edns = strip_opt(&mut query);
    if let Some(info) = edns {
        udp_budget = info.udp_payload_size as usize;

        if !info.is_supported_version() {
            tracing::debug!(version = %info.version, "unsupported EDNS version");
            let mut response = query.make_response();
            let (rcode, high) = split_extended_rcode(EXTENDED_RCODE_BADVERS);
            response.header.rcode = rcode;
            let mut opt = EdnsInfo::advertising(state.udpbufsize);
            opt.extended_rcode_high = high;
            append_opt(&mut response, opt);
            return Some((response, udp_budget));
        }
    }

    if query.header.opcode != Opcode::Standard {
        let mut response = query.make_response();
        response.header.rcode = Rcode::NotImplemented;
        return Some((finish(state, response, edns), udp_budget));
    }

    // one question per message: none is malformed, several are
    // unsupported
    if query.questions.is_empty() {
        return Some((
            Message::make_format_error_response(query.header.id),
            udp_budget,
        ));
    }
    if query.questions.len() > 1 {
        let mut response = query.make_response();
        response.header.rcode = Rcode::NotImplemented;
        return Some((finish(state, response, edns), udp_budget));
    }

    let question = &query.questions[0];
    if matches!(
        question.qtype,
        QueryType::AXFR | QueryType::MAILA | QueryType::MAILB
    ) {
        let mut response = query.make_response();
        response.header.rcode = Rcode::NotImplemented;
        return Some((finish(state, response, edns), udp_budget));
    }
    if question.is_unknown() {
        tracing::info!(%question, "refused");
        let mut response = query.make_response();
        response.header.rcode = Rcode::Refused;
        return Some((finish(state, response, edns), udp_budget));
    }

    let response = resolve_and_build_response(state, &query).await;
    Some((finish(state, response, edns), udp_budget))
}

/// Add the response's OPT record if the client spoke EDNS.
fn finish(state: &AppState, mut response: Message, edns: Option<EdnsInfo>) -> Message {
    if edns.is_some() {
        append_opt(&mut response, EdnsInfo::advertising(state.udpbufsize));
    }
    response
}

async fn resolve_and_build_response(state: &AppState, query: &Message) -> Message {
    let question = &query.questions[0];
    let mut response = query.make_response();
    response.header.is_authoritative = true;

    let mut context = ResolverContext::new(
        &state.opts,
        &state.sections,
        &state.servers,
        &state.cache,
        RECURSION_LIMIT,
    );

    let chain = follow_answer_chain(&mut context, question, state.randomize_recs).await;
    state.stats.merge(&context.done());

    response.answers = chain.answers;
    response.header.rcode = chain.rcode;
    response.header.is_authoritative = chain.authoritative;

    build_authority_sections(state, &chain.last_cent, &mut response);

    tracing::info!(
        %question,
        rcode = %response.header.rcode,
        answers = %response.answers.len(),
        "answered"
    );

    response
}

struct AnswerChain {
    answers: Vec<ResourceRecord>,
    rcode: Rcode,
    authoritative: bool,
    /// The entry which ended the chain, for the authority section.
    last_cent: Option<Cent>,
}

/// Emit the answer section: the queried name's records, following
/// aliases hop by hop.  Each hop is its own resolution (normally a
/// cache hit, since the resolver fills the cache with the whole
/// chain).  A loop or an over-long chain keeps the partial chain and
/// answers SERVFAIL.
async fn follow_answer_chain(
    context: &mut ResolverContext<'_>,
    question: &Question,
    randomize: bool,
) -> AnswerChain {
    let now = unix_now();
    let mut chain = AnswerChain {
        answers: Vec::new(),
        rcode: Rcode::NoError,
        authoritative: true,
        last_cent: None,
    };

    let want_cname_only = question.qtype == QueryType::Record(RecordType::CNAME);
    let mut current = question.name.clone();
    let mut visited: HashSet<DomainName> = HashSet::new();

    for hop in 0..=CNAME_HOP_LIMIT {
        if !visited.insert(current.clone()) {
            tracing::debug!(name = %current, "alias loop");
            chain.rcode = Rcode::ServerFailure;
            return chain;
        }

        let hop_question = Question {
            name: current.clone(),
            qtype: question.qtype,
            qclass: question.qclass,
        };

        let cent = match resolve(context, &hop_question).await {
            Ok(cent) => cent,
            Err(error) => {
                tracing::debug!(%error, name = %current, "resolution failed");
                chain.rcode = Rcode::ServerFailure;
                chain.authoritative = false;
                return chain;
            }
        };

        if cent.is_negative() {
            if chain.answers.is_empty() {
                chain.rcode = Rcode::NameError;
            }
            chain.authoritative &= cent.flags & (DF_AUTH | DF_LOCAL) != 0;
            chain.last_cent = Some(cent);
            return chain;
        }

        chain.authoritative &= cent.flags & DF_AUTH != 0
            || cent.flags & DF_LOCAL != 0
            || cent.rrsets().any(|(_, rrs)| rrs.is_local());

        let mut emitted_wanted = false;
        let mut cname_target = None;

        for (rtype, rrs) in cent.rrsets() {
            if rrs.is_negative() {
                continue;
            }

            let is_cname = rtype == RecordType::CNAME;
            let wanted = rtype.matches(question.qtype);
            if !wanted && !is_cname {
                continue;
            }

            let ttl = if rrs.is_local() {
                rrs.ttl
            } else {
                rrs.remaining_ttl(now)
            };

            // rotate the record order between responses, so clients
            // spread their load across equivalent records
            let offset = if randomize && rrs.records.len() > 1 {
                rand::random::<usize>() % rrs.records.len()
            } else {
                0
            };

            for i in 0..rrs.records.len() {
                let record = &rrs.records[(i + offset) % rrs.records.len()];
                chain.answers.push(ResourceRecord {
                    name: current.clone(),
                    rtype_with_data: record.clone(),
                    rclass: RecordClass::IN,
                    ttl,
                });
                if is_cname && !want_cname_only {
                    if let RecordTypeWithData::CNAME { cname } = record {
                        cname_target = Some(cname.clone());
                    }
                }
            }

            if wanted {
                emitted_wanted = true;
            }
        }

        chain.last_cent = Some(cent);

        match cname_target {
            Some(target) if !emitted_wanted && !want_cname_only => {
                if hop == CNAME_HOP_LIMIT {
                    break;
                }
                current = target;
            }
            _ => return chain,
        }
    }

    tracing::debug!("alias chain too long");
    chain.rcode = Rcode::ServerFailure;
    chain
}

/// Fill the authority and additional sections from the entry which
/// ended the chain: the SOA of the enclosing zone for negative and
/// empty answers, the zone's NS records (with address glue) for
/// positive ones.
fn build_authority_sections(state: &AppState, last_cent: &Option<Cent>, response: &mut Message) {
    let Some(cent) = last_cent else {
        return;
    };
    let now = unix_now();

    let negative_answer =
        response.header.rcode == Rcode::NameError || response.answers.is_empty();

    if negative_answer {
        let Some(k) = cent.c_soa else {
            return;
        };
        let Some(owner) = cent.name.ancestor_with_labels(usize::from(k)) else {
            return;
        };
        if let Some(rrs) = state.cache.lookup_rrset(&owner, RecordType::SOA) {
            let ttl = if rrs.is_local() {
                rrs.ttl
            } else {
                rrs.remaining_ttl(now)
            };
            for record in &rrs.records {
                response.authority.push(ResourceRecord {
                    name: owner.clone(),
                    rtype_with_data: record.clone(),
                    rclass: RecordClass::IN,
                    ttl,
                });
            }
        }
        return;
    }

    let Some(k) = cent.c_ns else {
        return;
    };
    let Some(owner) = cent.name.ancestor_with_labels(usize::from(k)) else {
        return;
    };

    // the zone's name servers, unless they are the answer already
    if response
        .answers
        .iter()
        .any(|rr| rr.rtype_with_data.rtype() == RecordType::NS && rr.name == owner)
    {
        return;
    }

    let Some(rrs) = state.cache.lookup_rrset(&owner, RecordType::NS) else {
        return;
    };
    let ttl = if rrs.is_local() {
        rrs.ttl
    } else {
        rrs.remaining_ttl(now)
    };

    let mut glue_names = Vec::new();
    for record in &rrs.records {
        if let RecordTypeWithData::NS { nsdname } = record {
            glue_names.push(nsdname.clone());
        }
        response.authority.push(ResourceRecord {
            name: owner.clone(),
            rtype_with_data: record.clone(),
            rclass: RecordClass::IN,
            ttl,
        });
    }

    for name in glue_names {
        for rtype in [RecordType::A, RecordType::AAAA] {
            if let Some(rrs) = state.cache.lookup_rrset(&name, rtype) {
                if rrs.is_negative() {
                    continue;
                }
                let ttl = if rrs.is_local() {
                    rrs.ttl
                } else {
                    rrs.remaining_ttl(now)
                };
                for record in &rrs.records {
                    response.additional.push(ResourceRecord {
                        name: name.clone(),
                        rtype_with_data: record.clone(),
                        rclass: RecordClass::IN,
                        ttl,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use bytes::Bytes;
    use dns_cache::entry::{CF_AUTH, CF_LOCAL};
    use dns_types::protocol::types::test_util::*;

    use super::*;
    use crate::test_util::test_state;

    fn query(name: &str, qtype: QueryType) -> Message {
        Message::from_question(
            1234,
            Question {
                name: domain(name),
                qtype,
                qclass: QueryClass::Record(RecordClass::IN),
            },
        )
    }

    fn a_query(name: &str) -> Message {
        query(name, QueryType::Record(RecordType::A))
    }

    #[tokio::test]
    async fn cached_a_record_is_served_with_its_rdata() {
        let state = test_state();
        let now = unix_now();

        let mut cent = Cent::new(domain("example.com."), 0);
        cent.add_record(
            3600,
            now,
            0,
            RecordTypeWithData::A {
                address: Ipv4Addr::new(93, 184, 216, 34),
            },
        )
        .unwrap();
        state.cache.add_cache(cent, now);

        let (response, _) = handle_message(&state, a_query("example.com."))
            .await
            .unwrap();

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(!response.header.is_authoritative);
        assert_eq!(1, response.answers.len());
        assert_eq!(
            RecordTypeWithData::A {
                address: Ipv4Addr::new(93, 184, 216, 34)
            },
            response.answers[0].rtype_with_data
        );
        // served TTL is the stored TTL minus the (tiny) age
        assert!((3598..=3600).contains(&response.answers[0].ttl));

        // and the serialised RDATA is the expected four octets
        let octets = response.answers[0].rtype_with_data.to_standalone_rdata();
        assert_eq!(&[0x5d, 0xb8, 0xd8, 0x22][..], &octets[..]);
    }

    #[tokio::test]
    async fn negative_cache_entry_answers_nxdomain() {
        let state = test_state();
        let now = unix_now();

        state.cache.add_cache(
            Cent::new_negative(domain("nosuch.example."), 900, now, dns_cache::entry::DF_AUTH),
            now,
        );

        let (response, _) = handle_message(&state, a_query("nosuch.example."))
            .await
            .unwrap();

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn cname_chain_is_emitted_in_full() {
        let state = test_state();
        let now = unix_now();

        let mut alias = Cent::new(domain("www.a.test."), 0);
        alias
            .add_record(
                300,
                now,
                0,
                RecordTypeWithData::CNAME {
                    cname: domain("b.test."),
                },
            )
            .unwrap();
        state.cache.add_cache(alias, now);

        let mut target = Cent::new(domain("b.test."), 0);
        target
            .add_record(
                300,
                now,
                0,
                RecordTypeWithData::A {
                    address: Ipv4Addr::new(1, 2, 3, 4),
                },
            )
            .unwrap();
        state.cache.add_cache(target, now);

        let (response, _) = handle_message(&state, a_query("www.a.test.")).await.unwrap();

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert_eq!(2, response.answers.len());
        assert_eq!(domain("www.a.test."), response.answers[0].name);
        assert_eq!(
            RecordTypeWithData::CNAME {
                cname: domain("b.test.")
            },
            response.answers[0].rtype_with_data
        );
        assert_eq!(domain("b.test."), response.answers[1].name);
        assert_eq!(
            RecordTypeWithData::A {
                address: Ipv4Addr::new(1, 2, 3, 4)
            },
            response.answers[1].rtype_with_data
        );
    }

    #[tokio::test]
    async fn cname_loop_answers_servfail_with_partial_chain() {
        let state = test_state();
        let now = unix_now();

        for (from, to) in [("a.test.", "b.test."), ("b.test.", "a.test.")] {
            let mut cent = Cent::new(domain(from), 0);
            cent.add_record(
                300,
                now,
                0,
                RecordTypeWithData::CNAME { cname: domain(to) },
            )
            .unwrap();
            state.cache.add_cache(cent, now);
        }

        let (response, _) = handle_message(&state, a_query("a.test.")).await.unwrap();

        assert_eq!(Rcode::ServerFailure, response.header.rcode);
        assert_eq!(2, response.answers.len());
    }

    #[tokio::test]
    async fn local_answer_is_authoritative() {
        let state = test_state();
        let now = unix_now();

        let mut cent = Cent::new(domain("printer.lan."), DF_LOCAL | DF_AUTH);
        cent.add_record(
            3600,
            now,
            CF_LOCAL | CF_AUTH,
            RecordTypeWithData::A {
                address: Ipv4Addr::new(10, 0, 0, 9),
            },
        )
        .unwrap();
        state.cache.add_cache(cent, now);

        let (response, _) = handle_message(&state, a_query("printer.lan."))
            .await
            .unwrap();

        assert!(response.header.is_authoritative);
        assert_eq!(1, response.answers.len());
        assert_eq!(3600, response.answers[0].ttl);
    }

    #[tokio::test]
    async fn local_zone_root_shadows_unknown_names() {
        let state = test_state();
        let now = unix_now();

        let mut zone_root = Cent::new(domain("lan."), DF_LOCAL | DF_AUTH);
        zone_root
            .add_record(
                3600,
                now,
                CF_LOCAL | CF_AUTH,
                RecordTypeWithData::A {
                    address: Ipv4Addr::new(10, 0, 0, 1),
                },
            )
            .unwrap();
        state.cache.add_cache(zone_root, now);

        // no upstreams are configured: if this leaked past the local
        // zone it would SERVFAIL, not NXDOMAIN
        let (response, _) = handle_message(&state, a_query("bogus.lan.")).await.unwrap();
        assert_eq!(Rcode::NameError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn cached_nxdomain_covers_the_subtree() {
        let state = test_state();
        let now = unix_now();

        state.cache.add_cache(
            Cent::new_negative(domain("ads.example."), 900, now, dns_cache::entry::DF_AUTH),
            now,
        );

        let (response, _) = handle_message(&state, a_query("tracker.ads.example."))
            .await
            .unwrap();
        assert_eq!(Rcode::NameError, response.header.rcode);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn multi_question_queries_are_not_implemented() {
        let state = test_state();
        let mut message = a_query("example.com.");
        message.questions.push(message.questions[0].clone());

        let (response, _) = handle_message(&state, message).await.unwrap();
        assert_eq!(Rcode::NotImplemented, response.header.rcode);
    }

    #[tokio::test]
    async fn empty_question_is_a_format_error() {
        let state = test_state();
        let mut message = a_query("example.com.");
        message.questions.clear();

        let (response, _) = handle_message(&state, message).await.unwrap();
        assert_eq!(Rcode::FormatError, response.header.rcode);
    }

    #[tokio::test]
    async fn responses_get_a_format_error() {
        let state = test_state();
        let mut message = a_query("example.com.");
        message.header.is_response = true;

        let (response, _) = handle_message(&state, message).await.unwrap();
        assert_eq!(Rcode::FormatError, response.header.rcode);
    }

    #[tokio::test]
    async fn unsupported_edns_version_gets_badvers() {
        let state = test_state();
        let mut message = a_query("example.com.");
        let mut opt = EdnsInfo::advertising(4096).to_record();
        // version 1 does not exist
        opt.ttl = u32::from_be_bytes([0, 1, 0, 0]);
        message.additional.push(opt);

        let (response, budget) = handle_message(&state, message).await.unwrap();

        assert_eq!(4096, budget);
        assert_eq!(Rcode::NoError, response.header.rcode);
        let info = EdnsInfo::from_record(&response.additional[0]).unwrap();
        assert_eq!(1, info.extended_rcode_high);
    }

    #[tokio::test]
    async fn edns_queries_get_an_opt_in_the_response() {
        let state = test_state();
        let now = unix_now();

        let mut cent = Cent::new(domain("example.com."), 0);
        cent.add_record(
            300,
            now,
            0,
            RecordTypeWithData::A {
                address: Ipv4Addr::LOCALHOST,
            },
        )
        .unwrap();
        state.cache.add_cache(cent, now);

        let mut message = a_query("example.com.");
        append_opt(&mut message, EdnsInfo::advertising(4096));

        let (response, budget) = handle_message(&state, message).await.unwrap();

        assert_eq!(4096, budget);
        assert_eq!(
            1,
            response
                .additional
                .iter()
                .filter(|rr| rr.rtype_with_data.rtype() == RecordType::OPT)
                .count()
        );
    }

    #[tokio::test]
    async fn unknown_qtype_is_refused() {
        let state = test_state();
        let message = query("example.com.", QueryType::Record(RecordType::from(65280)));

        let (response, _) = handle_message(&state, message).await.unwrap();
        assert_eq!(Rcode::Refused, response.header.rcode);
    }

    #[tokio::test]
    async fn nodata_answer_carries_soa_from_hint() {
        let state = test_state();
        let now = unix_now();

        // the zone SOA, and an entry with a negated MX set pointing
        // at it
        let mut apex = Cent::new(domain("example.com."), 0);
        apex.add_record(
            3600,
            now,
            0,
            RecordTypeWithData::SOA {
                mname: domain("ns.example.com."),
                rname: domain("hostmaster.example.com."),
                serial: 1,
                refresh: 3600,
                retry: 900,
                expire: 604_800,
                minimum: 900,
            },
        )
        .unwrap();
        state.cache.add_cache(apex, now);

        let mut cent = Cent::new(domain("www.example.com."), 0);
        cent.add_negated_rrset(RecordType::MX, 900, now, 0).unwrap();
        cent.c_soa = Some(2);
        state.cache.add_cache(cent, now);

        let (response, _) = handle_message(
            &state,
            query("www.example.com.", QueryType::Record(RecordType::MX)),
        )
        .await
        .unwrap();

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.answers.is_empty());
        assert_eq!(1, response.authority.len());
        assert_eq!(
            RecordType::SOA,
            response.authority[0].rtype_with_data.rtype()
        );
    }

    #[tokio::test]
    async fn txt_records_round_trip_through_the_chain() {
        let state = test_state();
        let now = unix_now();

        let mut cent = Cent::new(domain("example.com."), 0);
        cent.add_record(
            300,
            now,
            0,
            RecordTypeWithData::TXT {
                octets: Bytes::from_static(b"\x05hello"),
            },
        )
        .unwrap();
        state.cache.add_cache(cent, now);

        let (response, _) = handle_message(
            &state,
            query("example.com.", QueryType::Record(RecordType::TXT)),
        )
        .await
        .unwrap();

        assert_eq!(1, response.answers.len());
    }
}
