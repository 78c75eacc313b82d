/*!

This is the long-form manual for `poll_events` and `polltally`.

## Events

The following event types are understood. Everything else is dropped with an
`UnknownEventType` error.

| type                        | kind      | addressed by                      |
|-----------------------------|-----------|-----------------------------------|
| `net.nordeck.poll.group`    | state     | group id (state key)              |
| `net.nordeck.poll`          | state     | poll id (state key)               |
| `net.nordeck.poll.settings` | state     | empty key for the room, group id  |
| `net.nordeck.poll.vote`     | timeline  | poll id and sender                |
| `m.room.name`               | state     | empty key                         |

An event is a JSON object with the fields `type`, `room_id`, `sender`,
`origin_server_ts` (epoch milliseconds), `content`, and optionally
`event_id` and `state_key`:

```text
{"type": "net.nordeck.poll.vote", "room_id": "!room:example.org",
 "sender": "@alice:example.org", "event_id": "$abc",
 "origin_server_ts": 1714557600000,
 "content": {"schemaVersion": 1, "pollId": "p1", "answerId": "2"}}
```

Events without an `event_id` are identified by the SHA-256 digest of their
JSON text. When two events address the same entity, the one with the later
`origin_server_ts` wins, then the one with the smaller sender, then the one
with the smaller identity. The same rule decides between two votes of the
same voter on the same poll.

## Schema versions

Every payload declares its version in `schemaVersion` (`m.room.name` is
read as version 1 when the field is missing). Payloads are checked against
the shape of the version they declare, then upgraded one step at a time to
the current version.

### `net.nordeck.poll.group` (current: 2)

- version 1: `name`, `pollIds` (optional), `members` as a list of user ids.
- version 2: `members` maps each user id to `{"memberRole": ...}` with one of
  `moderator`, `participant`, `observer`. Upgraded version 1 members become
  participants.

### `net.nordeck.poll` (current: 3)

- version 1: `title`, `question` (optional), `answers` as a list of labels,
  `pollType` (`open` or `disclosed`), `resultType` (`visible` or
  `invisible`), `duration` in minutes, `startTime` (RFC 3339), both optional.
- version 2: `answers` become `{"id": ..., "label": ...}` objects. Upgraded
  answers take their 1-based position as id.
- version 3: `resultType` `invisible` is renamed `hidden`, and `endTime` is
  added. When upgrading, it is set to `startTime + duration` if both are
  present.

### `net.nordeck.poll.settings` (current: 2)

- version 1: `pdfButtonDisabledAfter` (optional, epoch milliseconds).
- version 2: `pollCreatorRoles`, a list of member roles. Upgraded settings
  allow moderators only.

### `net.nordeck.poll.vote` (current: 1)

`pollId` and `answerId`, both non-empty.

## Results

A poll belongs to the group (smallest id first) whose `pollIds` lists it.
Members of that group whose role carries a voting right are the eligible
voters, by default moderators and participants. The votes of other
senders, and votes for answers that the poll no longer offers, are kept but
not counted: they count again if the member or the answer comes back.

Polls of no group accept the votes of every sender by default. This is
controlled by [`UngroupedPolicy`](crate::UngroupedPolicy).

A poll is final once its end time is reached. Then:

- `resultType` `hidden` polls only report the number of cast votes until
  they are final.
- `pollType` `open` polls always report who chose which answer. `disclosed`
  polls report who voted, and reveal the choices once final.
- the winners are all the answers sharing the highest count. There are no
  winners if nobody voted.

## Configuration of `polltally`

`polltally` reads a JSON configuration file:

```text
{
  "rules": {"votingRoles": ["moderator", "participant"], "ungroupedPolls": "anyVoter"},
  "evaluatedAt": "2024-05-01T12:00:00Z",
  "outputSettings": {"reportName": "Board meeting", "outputPath": "report.json"}
}
```

All the fields are optional. `ungroupedPolls` is `anyVoter` or `noVoters`.
`evaluatedAt` is the instant at which the results are computed (the current
time by default). The command line arguments take precedence over the file.

 */
