//! SQL schemas used to initialize a package database.

/// Schema version of the tables. Any mismatch with a persisted database
/// triggers deletion and re-creation of the file.
pub const TABLES_SCHEMA_VERSION: &str = "0.2.0";

/// Schema version of the views. A views-only mismatch triggers view
/// re-creation without data loss.
pub const VIEWS_SCHEMA_VERSION: &str = "0.2.0";

/// Holds metadata information about schema versions.
pub(crate) const SQL_VERSIONS: &str = r#"
CREATE TABLE IF NOT EXISTS DbVersions (
  name     TEXT NOT NULL PRIMARY KEY
, version  TEXT NOT NULL
);
"#;

pub(crate) const SQL_INPUT: &str = r#"
CREATE TABLE IF NOT EXISTS LockedFlake (
  fingerprint  TEXT  PRIMARY KEY
, string       TEXT  NOT NULL
, attrs        JSON  NOT NULL
);

CREATE TRIGGER IF NOT EXISTS IT_LockedFlake AFTER INSERT ON LockedFlake
  WHEN ( 1 < ( SELECT COUNT( fingerprint ) FROM LockedFlake ) )
  BEGIN
    SELECT RAISE( ABORT, 'Cannot write conflicting LockedFlake info.' );
  END;
"#;

pub(crate) const SQL_ATTR_SETS: &str = r#"
CREATE TABLE IF NOT EXISTS AttrSets (
  id        INTEGER PRIMARY KEY
, parent    INTEGER NOT NULL DEFAULT 0
, attrName  VARCHAR( 255 ) NOT NULL
, done      BOOL NOT NULL DEFAULT FALSE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_AttrSets ON AttrSets ( parent, attrName );

CREATE TRIGGER IF NOT EXISTS IT_AttrSets AFTER INSERT ON AttrSets
  WHEN
    ( NEW.id = NEW.parent ) OR
    ( ( NEW.parent != 0 ) AND
      ( ( SELECT COUNT( id ) FROM AttrSets WHERE ( AttrSets.id = NEW.parent ) )
        < 1
      )
    )
  BEGIN
    SELECT RAISE( ABORT, 'No such AttrSets.id for parent.' );
  END;
"#;

pub(crate) const SQL_PACKAGES: &str = r#"
CREATE TABLE IF NOT EXISTS Descriptions (
  id           INTEGER PRIMARY KEY
, description  TEXT    NOT NULL UNIQUE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_Descriptions
  ON Descriptions ( description );

CREATE TABLE IF NOT EXISTS Packages (
  id                INTEGER PRIMARY KEY
, parentId          INTEGER        NOT NULL
, attrName          VARCHAR( 255 ) NOT NULL
, name              VARCHAR( 255 ) NOT NULL
, pname             VARCHAR( 255 )
, version           VARCHAR( 127 )
, semver            VARCHAR( 127 )
, license           VARCHAR( 255 )
, outputs           JSON           NOT NULL
, outputsToInstall  JSON
, broken            BOOL
, unfree            BOOL
, descriptionId     INTEGER
, FOREIGN KEY ( parentId      ) REFERENCES AttrSets     ( id )
, FOREIGN KEY ( descriptionId ) REFERENCES Descriptions ( id )
, CONSTRAINT UC_Packages UNIQUE ( parentId, attrName )
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_Packages
  ON Packages ( parentId, attrName );
"#;

/// `v_AttrPaths` reconstructs each attribute set's absolute path and the
/// `subtree`/`system`/`stability`/`relPath` fields derived from its shape.
/// `v_Semvers` explodes distinct semver strings into orderable components.
/// `v_PackagesSearch` joins everything queries need; `versionDate` relies
/// on the `version_date` scalar function registered on every connection.
pub(crate) const SQL_VIEWS: &str = r#"
CREATE VIEW IF NOT EXISTS v_AttrPaths AS
  WITH Tree ( id, parent, attrName, subtree, system, stability, path, relPath )
  AS
  (
    SELECT id, parent, attrName
         , attrName       AS subtree
         , NULL           AS system
         , NULL           AS stability
         , json_array( attrName ) AS path
         , json_array()   AS relPath
    FROM AttrSets WHERE ( parent = 0 )
    UNION ALL SELECT O.id, O.parent, O.attrName
                   , Parent.subtree
                   , iif( ( Parent.system IS NULL ), O.attrName, Parent.system )
                     AS system
                   , iif( ( Parent.stability IS NOT NULL )
                        , Parent.stability
                        , iif( ( ( Parent.subtree = 'catalog' ) AND
                                 ( Parent.system IS NOT NULL )
                               )
                             , O.attrName
                             , NULL
                             )
                        )
                     AS stability
                   , json_insert( Parent.path, '$[#]', O.attrName ) AS path
                   , iif( ( ( Parent.system IS NULL ) OR
                            ( ( Parent.subtree = 'catalog' ) AND
                              ( Parent.stability IS NULL )
                            )
                          )
                        , json_array()
                        , json_insert( Parent.relPath, '$[#]', O.attrName )
                        )
                     AS relPath
    FROM AttrSets O INNER JOIN Tree AS Parent ON ( Parent.id = O.parent )
  ) SELECT * FROM Tree;

CREATE VIEW IF NOT EXISTS v_Semvers AS SELECT
  semver
, CAST( major AS INTEGER ) AS major
, CAST( minor AS INTEGER ) AS minor
, CAST( iif( ( length( mPatch ) < 1 ), rest, mPatch ) AS INTEGER ) AS patch
, iif( ( length( mPatch ) < 1 ), NULL, rest ) AS preTag
FROM (
  SELECT semver
       , major
       , minor
       , ( substr( rest, 0, instr( rest, '-' ) ) )  AS mPatch
       , ( substr( rest, instr( rest, '-' ) + 1 ) ) AS rest
  FROM (
    SELECT semver
         , major
         , ( substr( rest, 0, instr( rest, '.' ) ) )  AS minor
         , ( substr( rest, instr( rest, '.' ) + 1 ) ) AS rest
    FROM (
      SELECT semver
           , ( substr( semver, 0, instr( semver, '.' ) ) )  AS major
           , ( substr( semver, instr( semver, '.' ) + 1 ) ) AS rest
      FROM ( SELECT DISTINCT semver FROM Packages WHERE semver IS NOT NULL )
    )
  )
);

CREATE VIEW IF NOT EXISTS v_PackagesSearch AS SELECT
  Packages.id
, v_AttrPaths.subtree
, v_AttrPaths.system
, v_AttrPaths.stability
, json_insert( v_AttrPaths.path, '$[#]', Packages.attrName )    AS path
, json_insert( v_AttrPaths.relPath, '$[#]', Packages.attrName ) AS relPath
, Packages.attrName
, Packages.name
, Packages.pname
, Packages.version
, Packages.semver
, Packages.license
, Packages.outputs
, Packages.outputsToInstall
, Packages.broken
, Packages.unfree
, iif( ( Packages.broken IS NULL ), FALSE, Packages.broken ) AS brokenRank
, iif( ( Packages.unfree IS NULL ), FALSE, Packages.unfree ) AS unfreeRank
, Descriptions.description
, v_Semvers.major
, v_Semvers.minor
, v_Semvers.patch
, v_Semvers.preTag
, version_date( Packages.version ) AS versionDate
FROM Packages
LEFT OUTER JOIN Descriptions ON ( Packages.descriptionId = Descriptions.id )
JOIN v_AttrPaths             ON ( Packages.parentId      = v_AttrPaths.id )
LEFT OUTER JOIN v_Semvers    ON ( Packages.semver        = v_Semvers.semver );
"#;

pub(crate) const SQL_DROP_VIEWS: &str = r#"
DROP VIEW IF EXISTS v_PackagesSearch;
DROP VIEW IF EXISTS v_Semvers;
DROP VIEW IF EXISTS v_AttrPaths;
"#;
